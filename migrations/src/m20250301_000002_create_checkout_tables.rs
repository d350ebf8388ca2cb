use sea_orm_migration::prelude::*;

use crate::m20250301_000001_create_catalog_tables::Products;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CheckoutSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CheckoutSessions::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::PublicId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::UserId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(CheckoutSessions::CartSnapshot).json_binary().null())
                    .col(
                        ColumnDef::new(CheckoutSessions::SelectedPaymentMethod)
                            .string_len(16)
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(CheckoutSessions::OrderId).big_integer().null())
                    .col(
                        ColumnDef::new(CheckoutSessions::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CheckoutSessions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // At most one active session per user. Partial indexes are not expressible
        // through the index builder, so the statement is issued directly; the syntax
        // is shared by PostgreSQL and SQLite.
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_checkout_active_session \
                 ON checkout_sessions (user_id) WHERE is_active",
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(InventoryReservations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(InventoryReservations::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(InventoryReservations::CheckoutSessionId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryReservations::ProductId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(InventoryReservations::OrderId).big_integer().null())
                    .col(
                        ColumnDef::new(InventoryReservations::Quantity)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryReservations::Status)
                            .string_len(16)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryReservations::ReservedUntil)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(InventoryReservations::LastError).text().null())
                    .col(
                        ColumnDef::new(InventoryReservations::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(InventoryReservations::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_reservations_checkout")
                            .from(
                                InventoryReservations::Table,
                                InventoryReservations::CheckoutSessionId,
                            )
                            .to(CheckoutSessions::Table, CheckoutSessions::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_reservations_product")
                            .from(InventoryReservations::Table, InventoryReservations::ProductId)
                            .to(Products::Table, Products::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_reservation_checkout_product")
                    .table(InventoryReservations::Table)
                    .col(InventoryReservations::CheckoutSessionId)
                    .col(InventoryReservations::ProductId)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_reservations_product_status")
                    .table(InventoryReservations::Table)
                    .col(InventoryReservations::ProductId)
                    .col(InventoryReservations::Status)
                    .col(InventoryReservations::ReservedUntil)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_reservations_order")
                    .table(InventoryReservations::Table)
                    .col(InventoryReservations::OrderId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(IdempotencyKeys::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(IdempotencyKeys::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(IdempotencyKeys::Key)
                            .string_len(128)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(IdempotencyKeys::CreatedBy).big_integer().not_null())
                    .col(ColumnDef::new(IdempotencyKeys::RequestHash).string_len(64).not_null())
                    .col(ColumnDef::new(IdempotencyKeys::OwnerType).string_len(32).null())
                    .col(ColumnDef::new(IdempotencyKeys::OwnerId).big_integer().null())
                    .col(ColumnDef::new(IdempotencyKeys::ResponseCode).integer().null())
                    .col(ColumnDef::new(IdempotencyKeys::ResponseBody).json_binary().null())
                    .col(
                        ColumnDef::new(IdempotencyKeys::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IdempotencyKeys::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(NamedLocks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(NamedLocks::LockKey)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(NamedLocks::AcquiredAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(NamedLocks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(IdempotencyKeys::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(InventoryReservations::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CheckoutSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CheckoutSessions {
    Table,
    Id,
    PublicId,
    UserId,
    CartSnapshot,
    SelectedPaymentMethod,
    IsActive,
    OrderId,
    ExpiresAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum InventoryReservations {
    Table,
    Id,
    CheckoutSessionId,
    ProductId,
    OrderId,
    Quantity,
    Status,
    ReservedUntil,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum IdempotencyKeys {
    Table,
    Id,
    Key,
    CreatedBy,
    RequestHash,
    OwnerType,
    OwnerId,
    ResponseCode,
    ResponseBody,
    CreatedAt,
    ExpiresAt,
}

#[derive(DeriveIden)]
enum NamedLocks {
    Table,
    LockKey,
    AcquiredAt,
}
