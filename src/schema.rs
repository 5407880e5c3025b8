//! Schema introspection for the restored database.
//!
//! Produces the flattened table/column listing embedded in every model
//! prompt. Reads `INFORMATION_SCHEMA` on a fresh connection each call, so a
//! chat turn always sees the catalog as it currently is.

use anyhow::Result;

use crate::config::MssqlConfig;
use crate::mssql;

/// Outcome of introspection. Sentinel variants instead of errors so callers
/// can branch on content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaSummary {
    NoDatabase,
    NoTables,
    Tables(String),
}

impl SchemaSummary {
    /// The schema text, when there is one.
    pub fn tables(&self) -> Option<&str> {
        match self {
            SchemaSummary::Tables(text) => Some(text),
            _ => None,
        }
    }
}

/// Summarize the base tables of `database`, one line per table:
/// `TABLE <schema>.<table>: <col> <type>, <col> <type>, ...`
///
/// Tables are ordered by (schema, name), columns by ordinal position.
/// Views and system tables are excluded by the `BASE TABLE` filter.
pub async fn summarize(config: &MssqlConfig, database: Option<&str>) -> Result<SchemaSummary> {
    let Some(database) = database else {
        return Ok(SchemaSummary::NoDatabase);
    };

    let mut client = mssql::connect(config, database).await?;

    let tables = client
        .query(
            "SELECT TABLE_SCHEMA, TABLE_NAME \
             FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' \
             ORDER BY TABLE_SCHEMA, TABLE_NAME",
            &[],
        )
        .await?
        .into_first_result()
        .await?;

    if tables.is_empty() {
        return Ok(SchemaSummary::NoTables);
    }

    let mut pairs = Vec::with_capacity(tables.len());
    for row in &tables {
        let schema: &str = row
            .try_get::<&str, usize>(0)?
            .ok_or_else(|| anyhow::anyhow!("NULL TABLE_SCHEMA in catalog"))?;
        let table: &str = row
            .try_get::<&str, usize>(1)?
            .ok_or_else(|| anyhow::anyhow!("NULL TABLE_NAME in catalog"))?;
        pairs.push((schema.to_string(), table.to_string()));
    }

    let mut lines = Vec::with_capacity(pairs.len());
    for (schema, table) in &pairs {
        let cols = client
            .query(
                "SELECT COLUMN_NAME, DATA_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = @P1 AND TABLE_NAME = @P2 \
                 ORDER BY ORDINAL_POSITION",
                &[schema, table],
            )
            .await?
            .into_first_result()
            .await?;

        let mut columns = Vec::with_capacity(cols.len());
        for row in &cols {
            let name: &str = row
                .try_get::<&str, usize>(0)?
                .ok_or_else(|| anyhow::anyhow!("NULL COLUMN_NAME in catalog"))?;
            let data_type: &str = row
                .try_get::<&str, usize>(1)?
                .ok_or_else(|| anyhow::anyhow!("NULL DATA_TYPE in catalog"))?;
            columns.push((name.to_string(), data_type.to_string()));
        }

        lines.push(format_table_line(schema, table, &columns));
    }

    Ok(SchemaSummary::Tables(lines.join("\n")))
}

fn format_table_line(schema: &str, table: &str, columns: &[(String, String)]) -> String {
    let col_defs = columns
        .iter()
        .map(|(name, data_type)| format!("{} {}", name, data_type))
        .collect::<Vec<_>>()
        .join(", ");
    format!("TABLE {}.{}: {}", schema, table, col_defs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_line_format() {
        let columns = vec![
            ("OrderID".to_string(), "int".to_string()),
            ("CustomerID".to_string(), "int".to_string()),
            ("Total".to_string(), "decimal".to_string()),
        ];
        assert_eq!(
            format_table_line("dbo", "Orders", &columns),
            "TABLE dbo.Orders: OrderID int, CustomerID int, Total decimal"
        );
    }

    #[test]
    fn table_line_with_no_columns() {
        assert_eq!(format_table_line("dbo", "Empty", &[]), "TABLE dbo.Empty: ");
    }

    #[tokio::test]
    async fn no_database_short_circuits() {
        // No connection attempt is made when there is no current database.
        let config = MssqlConfig::default();
        let summary = summarize(&config, None).await.unwrap();
        assert_eq!(summary, SchemaSummary::NoDatabase);
        assert!(summary.tables().is_none());
    }
}
