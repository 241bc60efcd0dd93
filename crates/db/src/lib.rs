pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_from_config, connect_with_settings, DbPool};
pub use repositories::{
    CommentRepository, InMemoryCommentRepository, InMemoryProcessRepository,
    InMemoryRequestRepository, ProcessRepository, RepositoryError, RequestRepository,
    SqlCommentRepository, SqlDirectory, SqlProcessRepository, SqlRequestRepository,
};
