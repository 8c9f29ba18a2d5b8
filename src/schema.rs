//! Relational schema model
//!
//! Table order is the declaration order reported by the database and is
//! significant: the anonymizer derives placeholder names from it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: false,
            is_primary_key: false,
            default_value: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

impl ForeignKey {
    pub fn new(
        column: impl Into<String>,
        references_table: impl Into<String>,
        references_column: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            references_table: references_table.into(),
            references_column: references_column.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_keys: Option<Vec<ForeignKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key: None,
            foreign_keys: None,
            row_count: None,
        }
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.get_or_insert_with(Vec::new).push(fk);
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub tables: Vec<Table>,
}

impl Schema {
    pub fn new(tables: Vec<Table>) -> Self {
        Self { tables }
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Serialized form used to detect schema drift in cache keys.
    pub fn fingerprint(&self) -> String {
        // Plain structs of strings and numbers; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Sample schema for trying the pipeline without a database.
    pub fn demo() -> Self {
        Self::new(vec![
            Table::new(
                "users",
                vec![
                    Column::new("id", "integer"),
                    Column::new("email", "varchar"),
                    Column::new("name", "varchar"),
                    Column::new("created_at", "timestamp"),
                    Column::new("is_active", "boolean"),
                ],
            ),
            Table::new(
                "orders",
                vec![
                    Column::new("id", "integer"),
                    Column::new("user_id", "integer"),
                    Column::new("total", "decimal"),
                    Column::new("status", "varchar"),
                    Column::new("created_at", "timestamp"),
                ],
            ),
            Table::new(
                "products",
                vec![
                    Column::new("id", "integer"),
                    Column::new("name", "varchar"),
                    Column::new("price", "decimal"),
                    Column::new("category", "varchar"),
                    Column::new("stock", "integer"),
                ],
            ),
            Table::new(
                "order_items",
                vec![
                    Column::new("id", "integer"),
                    Column::new("order_id", "integer"),
                    Column::new("product_id", "integer"),
                    Column::new("quantity", "integer"),
                    Column::new("price", "decimal"),
                ],
            ),
        ])
    }
}
