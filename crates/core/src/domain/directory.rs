//! Identities owned by the master-data services. The engine only ever holds
//! references to them; membership questions go through [`crate::resolver::Directory`].

use crate::domain::identifier;

identifier!(
    /// A concrete, resolved actor.
    EmployeeId
);
identifier!(RoleId);
identifier!(OrgUnitId);
identifier!(
    /// Scope for role membership lookups and owner of approval processes.
    OrganizationId
);
