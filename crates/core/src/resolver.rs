use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::directory::{EmployeeId, OrgUnitId, OrganizationId, RoleId};
use crate::domain::process::{ApprovalResponsibility, PrincipalSelector};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("directory lookup failed: {0}")]
pub struct DirectoryError(pub String);

/// Read-only view of master data used to expand selectors into employees.
///
/// Implementations must answer from current state; the engine never caches
/// membership between actions.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn members_with_role(
        &self,
        role_id: &RoleId,
        scope: &OrganizationId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError>;

    async fn members_of_unit(
        &self,
        org_unit_id: &OrgUnitId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError>;

    async fn employee_is_active(&self, employee_id: &EmployeeId) -> Result<bool, DirectoryError>;
}

#[async_trait]
impl<D> Directory for Arc<D>
where
    D: Directory + ?Sized,
{
    async fn members_with_role(
        &self,
        role_id: &RoleId,
        scope: &OrganizationId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
        (**self).members_with_role(role_id, scope).await
    }

    async fn members_of_unit(
        &self,
        org_unit_id: &OrgUnitId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
        (**self).members_of_unit(org_unit_id).await
    }

    async fn employee_is_active(&self, employee_id: &EmployeeId) -> Result<bool, DirectoryError> {
        (**self).employee_is_active(employee_id).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Primary,
    Fallback,
    Unresolved,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub principals: BTreeSet<EmployeeId>,
    pub source: ResolutionSource,
}

impl Resolution {
    pub fn unresolved() -> Self {
        Self { principals: BTreeSet::new(), source: ResolutionSource::Unresolved }
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }

    pub fn contains(&self, employee_id: &EmployeeId) -> bool {
        self.principals.contains(employee_id)
    }
}

#[derive(Clone, Debug)]
pub struct ResponsibilityResolver<D> {
    directory: D,
}

impl<D> ResponsibilityResolver<D>
where
    D: Directory,
{
    pub fn new(directory: D) -> Self {
        Self { directory }
    }

    /// Eligible principals for a step: the union of all primary selectors, or,
    /// when that is empty, the union of all fallback selectors.
    pub async fn resolve_eligible_principals(
        &self,
        scope: &OrganizationId,
        responsibilities: &[ApprovalResponsibility],
    ) -> Result<Resolution, DirectoryError> {
        let mut primary = BTreeSet::new();
        for responsibility in responsibilities {
            primary.extend(self.expand(&responsibility.primary, scope).await?);
        }
        if !primary.is_empty() {
            return Ok(Resolution { principals: primary, source: ResolutionSource::Primary });
        }

        let mut fallback = BTreeSet::new();
        for selector in responsibilities.iter().filter_map(|item| item.fallback.as_ref()) {
            fallback.extend(self.expand(selector, scope).await?);
        }
        if !fallback.is_empty() {
            return Ok(Resolution { principals: fallback, source: ResolutionSource::Fallback });
        }

        Ok(Resolution::unresolved())
    }

    pub async fn expand(
        &self,
        selector: &PrincipalSelector,
        scope: &OrganizationId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
        match selector {
            PrincipalSelector::Role(role_id) => {
                self.directory.members_with_role(role_id, scope).await
            }
            PrincipalSelector::OrgUnit(org_unit_id) => {
                self.directory.members_of_unit(org_unit_id).await
            }
            PrincipalSelector::Employee(employee_id) => {
                if self.directory.employee_is_active(employee_id).await? {
                    Ok(BTreeSet::from([employee_id.clone()]))
                } else {
                    Ok(BTreeSet::new())
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct DirectorySnapshot {
    employees: HashMap<EmployeeId, bool>,
    role_members: HashMap<(OrganizationId, RoleId), HashSet<EmployeeId>>,
    unit_members: HashMap<OrgUnitId, HashSet<EmployeeId>>,
}

impl DirectorySnapshot {
    fn is_active(&self, employee_id: &EmployeeId) -> bool {
        self.employees.get(employee_id).copied().unwrap_or(false)
    }

    fn active_only<'a>(
        &self,
        members: impl Iterator<Item = &'a EmployeeId>,
    ) -> BTreeSet<EmployeeId> {
        members.filter(|member| self.is_active(member)).cloned().collect()
    }
}

/// Mutable in-process directory. Clones share state, so a test can change
/// membership after a request was created and observe live resolution.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    snapshot: Arc<RwLock<DirectorySnapshot>>,
}

impl InMemoryDirectory {
    pub fn add_employee(&self, employee_id: EmployeeId, active: bool) -> &Self {
        self.write(|snapshot| {
            snapshot.employees.insert(employee_id, active);
        });
        self
    }

    pub fn set_active(&self, employee_id: &EmployeeId, active: bool) -> &Self {
        self.write(|snapshot| {
            if let Some(current) = snapshot.employees.get_mut(employee_id) {
                *current = active;
            }
        });
        self
    }

    pub fn grant_role(&self, scope: OrganizationId, role_id: RoleId, employee_id: EmployeeId) -> &Self {
        self.write(|snapshot| {
            snapshot.role_members.entry((scope, role_id)).or_default().insert(employee_id);
        });
        self
    }

    pub fn revoke_role(
        &self,
        scope: &OrganizationId,
        role_id: &RoleId,
        employee_id: &EmployeeId,
    ) -> &Self {
        self.write(|snapshot| {
            if let Some(members) = snapshot.role_members.get_mut(&(scope.clone(), role_id.clone())) {
                members.remove(employee_id);
            }
        });
        self
    }

    pub fn add_unit_member(&self, org_unit_id: OrgUnitId, employee_id: EmployeeId) -> &Self {
        self.write(|snapshot| {
            snapshot.unit_members.entry(org_unit_id).or_default().insert(employee_id);
        });
        self
    }

    fn write(&self, apply: impl FnOnce(&mut DirectorySnapshot)) {
        match self.snapshot.write() {
            Ok(mut snapshot) => apply(&mut snapshot),
            Err(poisoned) => apply(&mut poisoned.into_inner()),
        }
    }

    fn read<T>(&self, query: impl FnOnce(&DirectorySnapshot) -> T) -> T {
        match self.snapshot.read() {
            Ok(snapshot) => query(&snapshot),
            Err(poisoned) => query(&poisoned.into_inner()),
        }
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn members_with_role(
        &self,
        role_id: &RoleId,
        scope: &OrganizationId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
        Ok(self.read(|snapshot| {
            snapshot
                .role_members
                .get(&(scope.clone(), role_id.clone()))
                .map(|members| snapshot.active_only(members.iter()))
                .unwrap_or_default()
        }))
    }

    async fn members_of_unit(
        &self,
        org_unit_id: &OrgUnitId,
    ) -> Result<BTreeSet<EmployeeId>, DirectoryError> {
        Ok(self.read(|snapshot| {
            snapshot
                .unit_members
                .get(org_unit_id)
                .map(|members| snapshot.active_only(members.iter()))
                .unwrap_or_default()
        }))
    }

    async fn employee_is_active(&self, employee_id: &EmployeeId) -> Result<bool, DirectoryError> {
        Ok(self.read(|snapshot| snapshot.is_active(employee_id)))
    }
}
