//! The shop database's migration catalog.
//!
//! Every migration the application has ever shipped, in version order.
//! Never edit an entry once it has been applied anywhere; add a new one.

use stratum_core::migration::{BackfillSpec, ColumnDef, MigrationDefinition, SchemaChange};
use stratum_core::{MigrationRegistry, Result};

/// Build the registry of every shop migration.
pub fn registry() -> Result<MigrationRegistry> {
    MigrationRegistry::from_definitions([
        create_orders(),
        create_order_items(),
        create_products(),
        add_order_subtotal(),
        add_order_shipping(),
        add_item_customization(),
        add_product_images(),
    ])
}

fn create_orders() -> MigrationDefinition {
    MigrationDefinition::new(1, "0001_create_orders")
        .with_description("Orders placed by customers")
        .change(SchemaChange::create_table(
            "Orders",
            vec![
                ColumnDef::new("id", "INTEGER").primary_key(),
                ColumnDef::new("customer_email", "TEXT").not_null(),
                ColumnDef::new("status", "TEXT").not_null().default("'pending'"),
                ColumnDef::new("total", "NUMERIC").not_null().default("0.00"),
                ColumnDef::new("coupon_code", "TEXT"),
            ],
        ))
        .change(SchemaChange::create_index(
            "idx_orders_customer_email",
            "Orders",
            &["customer_email"],
        ))
}

fn create_order_items() -> MigrationDefinition {
    MigrationDefinition::new(2, "0002_create_order_items")
        .with_description("Line items belonging to an order")
        .change(SchemaChange::create_table(
            "OrderItems",
            vec![
                ColumnDef::new("id", "INTEGER").primary_key(),
                ColumnDef::new("order_id", "INTEGER")
                    .not_null()
                    .references("Orders", "id"),
                ColumnDef::new("product_id", "INTEGER").not_null(),
                ColumnDef::new("quantity", "INTEGER").not_null().default("1"),
                ColumnDef::new("unit_price", "NUMERIC").not_null().default("0.00"),
            ],
        ))
        .change(SchemaChange::create_index(
            "idx_order_items_order_id",
            "OrderItems",
            &["order_id"],
        ))
}

fn create_products() -> MigrationDefinition {
    MigrationDefinition::new(3, "0003_create_products")
        .with_description("Product catalog")
        .change(SchemaChange::create_table(
            "Products",
            vec![
                ColumnDef::new("id", "INTEGER").primary_key(),
                ColumnDef::new("name", "TEXT").not_null(),
                ColumnDef::new("price", "NUMERIC").not_null().default("0.00"),
                ColumnDef::new("description", "TEXT"),
            ],
        ))
        .change(SchemaChange::create_unique_index(
            "idx_products_name",
            "Products",
            &["name"],
        ))
}

/// Orders gain a stored subtotal computed from their line items.
fn add_order_subtotal() -> MigrationDefinition {
    MigrationDefinition::new(4, "0004_add_order_subtotal")
        .with_description("Store each order's item subtotal")
        .change(SchemaChange::add_column(
            "Orders",
            ColumnDef::new("subtotal", "NUMERIC"),
        ))
        .backfill(BackfillSpec::new("Orders", "subtotal IS NULL").set_expr(
            "subtotal",
            r#"SELECT COALESCE(SUM(oi.quantity * oi.unit_price), 0)
               FROM "OrderItems" oi WHERE oi.order_id = "Orders".id"#,
        ))
        .change(SchemaChange::set_not_null("Orders", "subtotal", Some("0.00")))
}

/// Flat shipping fee; orders placed before it existed are charged 5.00.
fn add_order_shipping() -> MigrationDefinition {
    MigrationDefinition::new(5, "0005_add_order_shipping")
        .with_description("Shipping fee charged on each order")
        .change(SchemaChange::add_column(
            "Orders",
            ColumnDef::new("shipping", "NUMERIC").default("0.00"),
        ))
        .backfill(
            BackfillSpec::new("Orders", "shipping IS NULL OR shipping = 0").set("shipping", 5.00),
        )
        .change(SchemaChange::set_not_null("Orders", "shipping", Some("0.00")))
}

/// Free-form JSON customization per line item. Stays nullable.
fn add_item_customization() -> MigrationDefinition {
    MigrationDefinition::new(6, "0006_add_item_customization")
        .with_description("Per-item customization as a JSON object")
        .change(SchemaChange::add_column(
            "OrderItems",
            ColumnDef::new("customization", "TEXT"),
        ))
        .backfill(
            BackfillSpec::new(
                "OrderItems",
                "customization = '' OR customization = 'null'",
            )
            .set("customization", "{}".to_string()),
        )
}

/// Product image URLs as a JSON array.
fn add_product_images() -> MigrationDefinition {
    MigrationDefinition::new(7, "0007_add_product_images")
        .with_description("Product image URLs as a JSON array")
        .change(SchemaChange::add_column(
            "Products",
            ColumnDef::new("images", "TEXT"),
        ))
        .backfill(
            BackfillSpec::new("Products", "images IS NULL OR images = ''")
                .set("images", "[]".to_string()),
        )
        .change(SchemaChange::set_not_null("Products", "images", Some("'[]'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use stratum_core::config::RunnerConfig;
    use stratum_core::{MigrationRunner, SafetyGrade, SchemaInspector};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON").unwrap();
        conn
    }

    #[test]
    fn test_registry_is_ordered_and_valid() {
        let registry = registry().unwrap();
        let versions: Vec<u64> = registry.all().map(|d| d.version()).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5, 6, 7]);
        assert!(registry
            .all()
            .all(|d| d.name().starts_with(&format!("{:04}_", d.version()))));
    }

    #[test]
    fn test_grades() {
        let registry = registry().unwrap();
        let grade = |name: &str| registry.get(name).unwrap().grade().overall_grade;
        assert_eq!(grade("0001_create_orders"), SafetyGrade::A);
        assert_eq!(grade("0006_add_item_customization"), SafetyGrade::B);
        assert_eq!(grade("0005_add_order_shipping"), SafetyGrade::C);
        assert!(registry.all().all(|d| !d.grade().is_destructive()));
    }

    #[test]
    fn test_subtotal_backfilled_from_items() {
        let conn = setup();
        let mut runner = MigrationRunner::new(&conn, registry().unwrap(), RunnerConfig::default());
        runner.up(Some("0003_create_products")).unwrap();

        conn.execute_batch(
            r#"
            INSERT INTO "Orders" (id, customer_email) VALUES (1, 'a@example.com');
            INSERT INTO "Orders" (id, customer_email) VALUES (2, 'b@example.com');
            INSERT INTO "OrderItems" (order_id, product_id, quantity, unit_price) VALUES (1, 10, 2, 3.50);
            INSERT INTO "OrderItems" (order_id, product_id, quantity, unit_price) VALUES (1, 11, 1, 4.00);
            "#,
        )
        .unwrap();

        let mut runner = MigrationRunner::new(&conn, registry().unwrap(), RunnerConfig::default());
        runner.up(None).unwrap();

        let subtotal = |id: i64| -> f64 {
            conn.query_row(
                r#"SELECT subtotal FROM "Orders" WHERE id = ?1"#,
                [id],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert!((subtotal(1) - 11.0).abs() < f64::EPSILON);
        assert!(subtotal(2).abs() < f64::EPSILON);

        let inspector = SchemaInspector::new(&conn);
        let column = inspector.column("Orders", "subtotal").unwrap().unwrap();
        assert!(!column.nullable);
        let shipping = inspector.column("Orders", "shipping").unwrap().unwrap();
        assert!(!shipping.nullable);
        assert!(shipping.default_matches(Some("0.00")));
    }

    #[test]
    fn test_customization_column_left_by_crash_is_adopted() {
        let conn = setup();
        let mut runner = MigrationRunner::new(&conn, registry().unwrap(), RunnerConfig::default());
        runner.up(Some("0005_add_order_shipping")).unwrap();

        // A previous run added the column and died before recording.
        conn.execute_batch(
            r#"
            ALTER TABLE "OrderItems" ADD COLUMN customization TEXT;
            INSERT INTO "Orders" (id, customer_email) VALUES (1, 'a@example.com');
            INSERT INTO "OrderItems" (id, order_id, product_id, customization) VALUES (1, 1, 10, NULL);
            INSERT INTO "OrderItems" (id, order_id, product_id, customization) VALUES (2, 1, 10, '');
            INSERT INTO "OrderItems" (id, order_id, product_id, customization) VALUES (3, 1, 10, 'null');
            INSERT INTO "OrderItems" (id, order_id, product_id, customization) VALUES (4, 1, 10, '{"engraving":"A"}');
            INSERT INTO "Products" (id, name) VALUES (10, 'mug');
            "#,
        )
        .unwrap();

        let mut runner = MigrationRunner::new(&conn, registry().unwrap(), RunnerConfig::default());
        let report = runner.up(None).unwrap();
        let names: Vec<_> = report.applied.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["0006_add_item_customization", "0007_add_product_images"]);
        assert_eq!(report.applied[0].changes_skipped, 1);
        assert_eq!(report.applied[0].rows_backfilled, 2);

        let customizations: Vec<Option<String>> = conn
            .prepare(r#"SELECT customization FROM "OrderItems" ORDER BY id"#)
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            customizations,
            vec![
                None,
                Some("{}".to_string()),
                Some("{}".to_string()),
                Some(r#"{"engraving":"A"}"#.to_string()),
            ]
        );

        let images: String = conn
            .query_row(r#"SELECT images FROM "Products" WHERE id = 10"#, [], |row| row.get(0))
            .unwrap();
        assert_eq!(images, "[]");
    }
}
