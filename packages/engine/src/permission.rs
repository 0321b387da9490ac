use sea_orm::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{content_object, group, group_member, group_permission, user};
use crate::error::VaultError;

/// Actions a principal can request against a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Execute,
    /// Requires read.
    Download,
    /// Requires write.
    Delete,
    /// Requires read.
    Share,
}

/// One rwx triad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triad {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Triad {
    fn from_bits(bits: i32) -> Self {
        Self {
            read: bits & 0o4 != 0,
            write: bits & 0o2 != 0,
            execute: bits & 0o1 != 0,
        }
    }

    const NONE: Triad = Triad {
        read: false,
        write: false,
        execute: false,
    };

    const FULL: Triad = Triad {
        read: true,
        write: true,
        execute: true,
    };
}

/// An octal permission mask (`OGX`: owner, group, others triads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mask(i32);

impl Mask {
    pub const DEFAULT_OBJECT: Mask = Mask(0o644);

    /// Validate a raw mask value (0..=0o777).
    pub fn new(value: i32) -> Result<Self, VaultError> {
        if !(0..=0o777).contains(&value) {
            return Err(VaultError::InvalidInput(format!(
                "permission mask out of range: {value:#o}"
            )));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> i32 {
        self.0
    }

    pub fn owner(&self) -> Triad {
        Triad::from_bits((self.0 >> 6) & 0o7)
    }

    pub fn group(&self) -> Triad {
        Triad::from_bits((self.0 >> 3) & 0o7)
    }

    pub fn others(&self) -> Triad {
        Triad::from_bits(self.0 & 0o7)
    }

    /// Three-digit octal rendering, e.g. `"644"`.
    pub fn to_octal_string(&self) -> String {
        format!("{:03o}", self.0)
    }
}

/// The resolved permission triple for one principal against one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Effective {
    pub can_read: bool,
    pub can_write: bool,
    pub can_execute: bool,
}

impl Effective {
    fn from_triad(t: Triad) -> Self {
        Self {
            can_read: t.read,
            can_write: t.write,
            can_execute: t.execute,
        }
    }

    pub const NONE: Effective = Effective {
        can_read: false,
        can_write: false,
        can_execute: false,
    };

    pub fn allows(&self, action: Action) -> bool {
        match action {
            Action::Read | Action::Download | Action::Share => self.can_read,
            Action::Write | Action::Delete => self.can_write,
            Action::Execute => self.can_execute,
        }
    }
}

/// Everything the resolver needs to know about the requesting principal.
/// Loaded once per request with explicit projections.
#[derive(Debug, Clone)]
pub struct PrincipalContext {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub group_ids: Vec<Uuid>,
    /// Member of the organization's `admin` system group.
    pub is_org_admin: bool,
}

/// The object-side inputs: ownership, org scope, mask, overrides.
#[derive(Debug, Clone)]
pub struct ObjectPermissionMeta {
    pub owner_id: Uuid,
    pub organization_id: Uuid,
    pub primary_group_id: Uuid,
    pub mask: Mask,
    /// Per-group override masks, `(group_id, mask)`.
    pub overrides: Vec<(Uuid, Mask)>,
}

/// Compute the effective triple. Precedence:
///
/// 1. cross-organization: nothing, unconditionally
/// 2. organization admin: everything
/// 3. owner: owner triad
/// 4. any override group the principal belongs to: OR of those overrides'
///    group triads (membership is additive, so overrides widen)
/// 5. the object's primary group: the object mask's group triad
/// 6. otherwise: the others triad
pub fn resolve(principal: &PrincipalContext, object: &ObjectPermissionMeta) -> Effective {
    resolve_with_scope(principal, object, false)
}

/// Resolution for a principal holding a live reference to the object.
///
/// Deduplication shares objects across organizations, so a principal's own
/// reference may point at an object anchored in another tenant. Holding the
/// reference proves the principal ingested those exact bytes; resolution
/// proceeds through the normal chain instead of the cross-tenant wall.
pub fn resolve_for_reference_holder(
    principal: &PrincipalContext,
    object: &ObjectPermissionMeta,
) -> Effective {
    resolve_with_scope(principal, object, true)
}

fn resolve_with_scope(
    principal: &PrincipalContext,
    object: &ObjectPermissionMeta,
    holds_reference: bool,
) -> Effective {
    if principal.organization_id != object.organization_id && !holds_reference {
        return Effective::NONE;
    }

    if principal.is_org_admin && principal.organization_id == object.organization_id {
        return Effective::from_triad(Triad::FULL);
    }

    if principal.user_id == object.owner_id {
        return Effective::from_triad(object.mask.owner());
    }

    let mut matched_override = false;
    let mut combined = Triad::NONE;
    for (group_id, mask) in &object.overrides {
        if principal.group_ids.contains(group_id) {
            matched_override = true;
            let triad = mask.group();
            combined.read |= triad.read;
            combined.write |= triad.write;
            combined.execute |= triad.execute;
        }
    }
    if matched_override {
        return Effective::from_triad(combined);
    }

    if principal.group_ids.contains(&object.primary_group_id) {
        return Effective::from_triad(object.mask.group());
    }

    Effective::from_triad(object.mask.others())
}

/// Load the principal context in one pass: the user row plus a joined
/// membership query that also reveals admin standing.
pub async fn load_principal_context<C: ConnectionTrait>(
    db: &C,
    user_id: Uuid,
) -> Result<PrincipalContext, VaultError> {
    let principal = user::Entity::find_by_id(user_id)
        .one(db)
        .await?
        .ok_or(VaultError::NotFound)?;

    let memberships: Vec<(group_member::Model, Option<group::Model>)> =
        group_member::Entity::find()
            .filter(group_member::Column::UserId.eq(user_id))
            .find_also_related(group::Entity)
            .all(db)
            .await?;

    let mut group_ids = Vec::with_capacity(memberships.len());
    let mut is_org_admin = false;
    for (membership, joined_group) in memberships {
        group_ids.push(membership.group_id);
        if let Some(g) = joined_group
            && g.is_system
            && g.name == group::SYSTEM_ADMIN
            && g.organization_id == principal.organization_id
        {
            is_org_admin = true;
        }
    }

    Ok(PrincipalContext {
        user_id,
        organization_id: principal.organization_id,
        group_ids,
        is_org_admin,
    })
}

/// Load the object-side permission inputs: object row joined with its
/// primary group (for the organization scope) plus all override rows.
pub async fn load_object_meta<C: ConnectionTrait>(
    db: &C,
    object: &content_object::Model,
) -> Result<ObjectPermissionMeta, VaultError> {
    let primary_group = group::Entity::find_by_id(object.primary_group_id)
        .one(db)
        .await?
        .ok_or_else(|| {
            VaultError::internal(format!(
                "content object {} has dangling primary group",
                object.id
            ))
        })?;

    let overrides = group_permission::Entity::find()
        .filter(group_permission::Column::ContentObjectId.eq(object.id))
        .all(db)
        .await?
        .into_iter()
        .filter_map(|row| Mask::new(row.permission_mask).ok().map(|m| (row.group_id, m)))
        .collect();

    Ok(ObjectPermissionMeta {
        owner_id: object.owner_id,
        organization_id: primary_group.organization_id,
        primary_group_id: object.primary_group_id,
        mask: Mask::new(object.permission_mask)?,
        overrides,
    })
}
