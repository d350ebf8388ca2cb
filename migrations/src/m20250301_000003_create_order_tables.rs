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
                    .table(Orders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Orders::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Orders::PublicId).uuid().not_null().unique_key())
                    .col(ColumnDef::new(Orders::UserId).big_integer().not_null())
                    .col(ColumnDef::new(Orders::CheckoutSessionId).big_integer().not_null())
                    .col(ColumnDef::new(Orders::Status).string_len(32).not_null())
                    .col(ColumnDef::new(Orders::PaymentMethod).string_len(16).not_null())
                    .col(
                        ColumnDef::new(Orders::Currency)
                            .string_len(3)
                            .not_null()
                            .default("INR"),
                    )
                    .col(ColumnDef::new(Orders::Subtotal).big_integer().not_null())
                    .col(ColumnDef::new(Orders::Tax).big_integer().not_null())
                    .col(ColumnDef::new(Orders::Shipping).big_integer().not_null())
                    .col(ColumnDef::new(Orders::CodFee).big_integer().not_null())
                    .col(ColumnDef::new(Orders::Discount).big_integer().not_null())
                    .col(ColumnDef::new(Orders::Total).big_integer().not_null())
                    .col(ColumnDef::new(Orders::PlacedAt).timestamp_with_time_zone().null())
                    .col(
                        ColumnDef::new(Orders::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Orders::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_orders_user_status")
                    .table(Orders::Table)
                    .col(Orders::UserId)
                    .col(Orders::Status)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(OrderItems::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OrderItems::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OrderItems::OrderId).big_integer().not_null())
                    .col(ColumnDef::new(OrderItems::ProductId).big_integer().not_null())
                    .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                    .col(
                        ColumnDef::new(OrderItems::UnitPriceSnapshot)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(OrderItems::TaxSnapshot).big_integer().not_null())
                    .col(ColumnDef::new(OrderItems::LineTotal).big_integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_order_items_order")
                            .from(OrderItems::Table, OrderItems::OrderId)
                            .to(Orders::Table, Orders::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_order_items_product")
                            .from(OrderItems::Table, OrderItems::ProductId)
                            .to(Products::Table, Products::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_order_items_order_product")
                    .table(OrderItems::Table)
                    .col(OrderItems::OrderId)
                    .col(OrderItems::ProductId)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Payments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Payments::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Payments::PublicId).uuid().not_null().unique_key())
                    .col(ColumnDef::new(Payments::OrderId).big_integer().not_null())
                    .col(ColumnDef::new(Payments::Provider).string_len(32).not_null())
                    .col(
                        ColumnDef::new(Payments::ProviderOrderId)
                            .string_len(128)
                            .null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Payments::ProviderPaymentId)
                            .string_len(128)
                            .null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Payments::Status).string_len(16).not_null())
                    .col(ColumnDef::new(Payments::Amount).big_integer().not_null())
                    .col(
                        ColumnDef::new(Payments::Currency)
                            .string_len(3)
                            .not_null()
                            .default("INR"),
                    )
                    .col(ColumnDef::new(Payments::PaidAt).timestamp_with_time_zone().null())
                    .col(
                        ColumnDef::new(Payments::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Payments::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_payments_order")
                            .from(Payments::Table, Payments::OrderId)
                            .to(Orders::Table, Orders::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PaymentWebhookEvents::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PaymentWebhookEvents::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(PaymentWebhookEvents::Provider)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PaymentWebhookEvents::ProviderEventId)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PaymentWebhookEvents::EventType)
                            .string_len(64)
                            .null(),
                    )
                    .col(ColumnDef::new(PaymentWebhookEvents::Payload).json_binary().not_null())
                    .col(ColumnDef::new(PaymentWebhookEvents::PaymentId).big_integer().null())
                    .col(ColumnDef::new(PaymentWebhookEvents::LastError).text().null())
                    .col(
                        ColumnDef::new(PaymentWebhookEvents::ProcessedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PaymentWebhookEvents::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_webhook_provider_event")
                    .table(PaymentWebhookEvents::Table)
                    .col(PaymentWebhookEvents::Provider)
                    .col(PaymentWebhookEvents::ProviderEventId)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PaymentWebhookEvents::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Payments::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(OrderItems::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Orders::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(crate) enum Orders {
    Table,
    Id,
    PublicId,
    UserId,
    CheckoutSessionId,
    Status,
    PaymentMethod,
    Currency,
    Subtotal,
    Tax,
    Shipping,
    CodFee,
    Discount,
    Total,
    PlacedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum OrderItems {
    Table,
    Id,
    OrderId,
    ProductId,
    Quantity,
    UnitPriceSnapshot,
    TaxSnapshot,
    LineTotal,
}

#[derive(DeriveIden)]
enum Payments {
    Table,
    Id,
    PublicId,
    OrderId,
    Provider,
    ProviderOrderId,
    ProviderPaymentId,
    Status,
    Amount,
    Currency,
    PaidAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum PaymentWebhookEvents {
    Table,
    Id,
    Provider,
    ProviderEventId,
    EventType,
    Payload,
    PaymentId,
    LastError,
    ProcessedAt,
    ReceivedAt,
}
