use chrono::Utc;
use sea_orm::sea_query::{Index, PostgresQueryBuilder};
use sea_orm::*;
use tracing::info;
use uuid::Uuid;

use crate::entity::{group, group_member, organization, user, user_reference};
use crate::error::VaultError;

/// System groups every organization starts with: (name, mask, description).
const SYSTEM_GROUPS: &[(&str, i32, &str)] = &[
    (group::SYSTEM_ADMIN, 0o777, "Full control over the organization"),
    (group::SYSTEM_USERS, 0o664, "Default group for organization members"),
    (group::SYSTEM_GUESTS, 0o444, "Read-only visitors"),
];

/// A freshly bootstrapped organization.
pub struct CreatedOrganization {
    pub organization: organization::Model,
    pub creator: user::Model,
    /// The three system groups, in `SYSTEM_GROUPS` order.
    pub groups: Vec<group::Model>,
}

/// Create an organization together with its creator account.
///
/// Atomic: the organization row, the three system groups, the creator and
/// the creator's `admin` membership all commit together or not at all.
pub async fn create_organization(
    db: &DatabaseConnection,
    name: &str,
    creator_username: &str,
    creator_password_hash: &str,
    allocated_mb: i64,
) -> Result<CreatedOrganization, VaultError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(VaultError::InvalidInput(
            "Organization name must be 1-100 characters".into(),
        ));
    }
    if allocated_mb < 1 {
        return Err(VaultError::InvalidInput(
            "Allocated quota must be at least 1 MiB".into(),
        ));
    }
    let creator_username = creator_username.trim();
    if creator_username.is_empty() || creator_username.chars().count() > 50 {
        return Err(VaultError::InvalidInput(
            "Username must be 1-50 characters".into(),
        ));
    }

    let txn = db.begin().await?;
    let now = Utc::now();

    let org_id = Uuid::new_v4();
    let creator_id = Uuid::new_v4();

    let org = organization::ActiveModel {
        id: Set(org_id),
        name: Set(name.to_string()),
        created_by: Set(creator_id),
        allocated_mb: Set(allocated_mb),
        used_bytes: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    };
    let organization = org.insert(&txn).await.map_err(unique_to_conflict)?;

    let creator = user::ActiveModel {
        id: Set(creator_id),
        username: Set(creator_username.to_string()),
        password_hash: Set(creator_password_hash.to_string()),
        organization_id: Set(org_id),
        created_at: Set(now),
    };
    let creator = creator.insert(&txn).await.map_err(unique_to_conflict)?;

    let mut groups = Vec::with_capacity(SYSTEM_GROUPS.len());
    for &(group_name, mask, description) in SYSTEM_GROUPS {
        let model = group::ActiveModel {
            id: Set(Uuid::new_v4()),
            organization_id: Set(org_id),
            name: Set(group_name.to_string()),
            description: Set(description.to_string()),
            permission_mask: Set(mask),
            is_system: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        };
        groups.push(model.insert(&txn).await?);
    }

    // The creator lands in admin; NULL assigned_by marks the bootstrap.
    let admin_group = &groups[0];
    group_member::ActiveModel {
        id: Set(Uuid::new_v4()),
        group_id: Set(admin_group.id),
        user_id: Set(creator_id),
        assigned_at: Set(now),
        assigned_by: Set(None),
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;

    info!(organization = name, "created organization with system groups");

    Ok(CreatedOrganization {
        organization,
        creator,
        groups,
    })
}

/// Register a principal into an existing organization.
///
/// New members join the `users` system group.
pub async fn register_user(
    db: &DatabaseConnection,
    organization_id: Uuid,
    username: &str,
    password_hash: &str,
) -> Result<user::Model, VaultError> {
    let username = username.trim();
    if username.is_empty() || username.chars().count() > 50 {
        return Err(VaultError::InvalidInput(
            "Username must be 1-50 characters".into(),
        ));
    }

    let users_group = group::Entity::find()
        .filter(group::Column::OrganizationId.eq(organization_id))
        .filter(group::Column::Name.eq(group::SYSTEM_USERS))
        .one(db)
        .await?
        .ok_or(VaultError::NotFound)?;

    let txn = db.begin().await?;
    let now = Utc::now();
    let user_id = Uuid::new_v4();

    let new_user = user::ActiveModel {
        id: Set(user_id),
        username: Set(username.to_string()),
        password_hash: Set(password_hash.to_string()),
        organization_id: Set(organization_id),
        created_at: Set(now),
    };
    let created = new_user.insert(&txn).await.map_err(unique_to_conflict)?;

    group_member::ActiveModel {
        id: Set(Uuid::new_v4()),
        group_id: Set(users_group.id),
        user_id: Set(user_id),
        assigned_at: Set(now),
        assigned_by: Set(None),
    }
    .insert(&txn)
    .await?;

    txn.commit().await?;

    Ok(created)
}

/// Add a user to a group within the same organization.
pub async fn add_group_member(
    db: &DatabaseConnection,
    group_id: Uuid,
    user_id: Uuid,
    assigned_by: Uuid,
) -> Result<(), VaultError> {
    let target_group = group::Entity::find_by_id(group_id)
        .one(db)
        .await?
        .ok_or(VaultError::NotFound)?;
    let target_user = user::Entity::find_by_id(user_id)
        .one(db)
        .await?
        .ok_or(VaultError::NotFound)?;

    if target_user.organization_id != target_group.organization_id {
        return Err(VaultError::Forbidden);
    }

    let already = group_member::Entity::find()
        .filter(group_member::Column::GroupId.eq(group_id))
        .filter(group_member::Column::UserId.eq(user_id))
        .one(db)
        .await?;
    if already.is_some() {
        return Ok(());
    }

    group_member::ActiveModel {
        id: Set(Uuid::new_v4()),
        group_id: Set(group_id),
        user_id: Set(user_id),
        assigned_at: Set(Utc::now()),
        assigned_by: Set(Some(assigned_by)),
    }
    .insert(db)
    .await?;

    Ok(())
}

fn unique_to_conflict(err: DbErr) -> VaultError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            VaultError::InvalidInput("name is already taken".into())
        }
        _ => VaultError::from(err),
    }
}

/// Ensure required database indexes exist.
///
/// SeaORM's schema-sync doesn't support partial, composite or GIN indexes,
/// so we create them manually on startup.
pub async fn ensure_indexes(db: &DatabaseConnection) -> Result<(), DbErr> {
    // Filename uniqueness holds only among live references; soft-deleted
    // rows keep their names without blocking re-upload.
    run_ddl(
        db,
        "idx_user_reference_live_name",
        "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_user_reference_live_name\" \
         ON \"user_reference\" (\"user_id\", \"folder_path\", \"user_filename\") \
         WHERE NOT \"is_deleted\"",
    )
    .await;

    // Group names are unique per organization.
    run_ddl(
        db,
        "idx_group_org_name",
        "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_group_org_name\" \
         ON \"group\" (\"organization_id\", \"name\")",
    )
    .await;

    // One override row per (object, group).
    run_ddl(
        db,
        "idx_group_permission_object_group",
        "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_group_permission_object_group\" \
         ON \"group_permission\" (\"content_object_id\", \"group_id\")",
    )
    .await;

    // Audit query paths: newest-first scans, per-principal action history,
    // per-resource history, and ad-hoc detail lookups.
    run_ddl(
        db,
        "idx_audit_created_desc",
        "CREATE INDEX IF NOT EXISTS \"idx_audit_created_desc\" \
         ON \"audit_event\" (\"created_at\" DESC)",
    )
    .await;
    run_ddl(
        db,
        "idx_audit_details_gin",
        "CREATE INDEX IF NOT EXISTS \"idx_audit_details_gin\" \
         ON \"audit_event\" USING GIN (\"details\")",
    )
    .await;

    let stmt = Index::create()
        .if_not_exists()
        .name("idx_audit_user_action")
        .table(crate::entity::audit_event::Entity)
        .col(crate::entity::audit_event::Column::UserId)
        .col(crate::entity::audit_event::Column::Action)
        .to_string(PostgresQueryBuilder);
    run_ddl(db, "idx_audit_user_action", &stmt).await;

    let stmt = Index::create()
        .if_not_exists()
        .name("idx_audit_resource")
        .table(crate::entity::audit_event::Entity)
        .col(crate::entity::audit_event::Column::ResourceType)
        .col(crate::entity::audit_event::Column::ResourceId)
        .to_string(PostgresQueryBuilder);
    run_ddl(db, "idx_audit_resource", &stmt).await;

    // Folder listings filter by (user, folder, live).
    let stmt = Index::create()
        .if_not_exists()
        .name("idx_user_reference_user_folder")
        .table(user_reference::Entity)
        .col(user_reference::Column::UserId)
        .col(user_reference::Column::FolderPath)
        .to_string(PostgresQueryBuilder);
    run_ddl(db, "idx_user_reference_user_folder", &stmt).await;

    Ok(())
}

async fn run_ddl(db: &DatabaseConnection, name: &str, stmt: &str) {
    match db.execute_unprepared(stmt).await {
        Ok(_) => {
            info!("Ensured index {name} exists");
        }
        Err(e) => {
            tracing::warn!("Failed to create index {name}: {e}");
        }
    }
}
