//! Native type tables, one per dialect, built once on first use

use super::Dialect;
use crate::value::ScalarKind;
use std::collections::HashMap;
use std::sync::OnceLock;

type TypeMap = HashMap<ScalarKind, &'static str>;

static TABLES: OnceLock<HashMap<Dialect, TypeMap>> = OnceLock::new();

pub(crate) fn native_type(dialect: Dialect, kind: ScalarKind) -> Option<&'static str> {
    TABLES
        .get_or_init(|| Dialect::all().iter().map(|d| (*d, build(*d))).collect())
        .get(&dialect)
        .and_then(|table| table.get(&kind).copied())
}

fn build(dialect: Dialect) -> TypeMap {
    use ScalarKind::*;

    let entries: &[(ScalarKind, &'static str)] = match dialect {
        Dialect::H2 => &[
            (Int, "int"),
            (Long, "bigint"),
            (Float, "real"),
            (Double, "double"),
            (Short, "smallint"),
            (Byte, "tinyint"),
            (Boolean, "boolean"),
            (String, "varchar"),
            (Date, "bigint"),
            (Time, "bigint"),
            (DateTime, "bigint"),
            (Timestamp, "bigint"),
        ],
        Dialect::Sqlite => &[
            (Int, "integer"),
            (Long, "integer"),
            (Short, "integer"),
            (Byte, "integer"),
            (Float, "real"),
            (Double, "real"),
            (Boolean, "bit"),
            (String, "text"),
            (List, "text"),
            (Date, "integer"),
            (Time, "integer"),
            (DateTime, "integer"),
            (Timestamp, "integer"),
        ],
        Dialect::MariaDb => &[
            (Int, "integer"),
            (Long, "bigint"),
            (Float, "float"),
            (Double, "double"),
            (Short, "smallint"),
            (Byte, "tinyint"),
            (Boolean, "boolean"),
            (String, "text"),
            (List, "json"),
            (Date, "bigint"),
            (Time, "bigint"),
            (DateTime, "bigint"),
            (Timestamp, "bigint"),
        ],
        Dialect::Postgres => &[
            (Int, "int"),
            (Long, "bigint"),
            (Float, "real"),
            (Double, "double precision"),
            (Short, "smallint"),
            (Byte, "smallint"),
            (Boolean, "boolean"),
            (String, "varchar"),
            (List, "varchar"),
            (Date, "bigint"),
            (Time, "bigint"),
            (DateTime, "bigint"),
            (Timestamp, "bigint"),
        ],
        Dialect::DuckDb => &[
            (Int, "integer"),
            (Long, "long"),
            (Float, "float"),
            (Double, "double"),
            (Short, "short"),
            (Byte, "tinyint"),
            (Boolean, "boolean"),
            (String, "varchar"),
            (List, "varchar[]"),
            (Date, "bigint"),
            (Time, "bigint"),
            (DateTime, "bigint"),
            (Timestamp, "bigint"),
        ],
        Dialect::Mongo => &[
            (Int, "int"),
            (Long, "long"),
            (Short, "int"),
            (Byte, "int"),
            (Float, "double"),
            (Double, "double"),
            (Boolean, "bool"),
            (String, "string"),
            (List, "array"),
            (Date, "long"),
            (Time, "long"),
            (DateTime, "long"),
            (Timestamp, "long"),
        ],
    };

    entries.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_dialect_maps_core_scalars() {
        let core = [
            ScalarKind::Int,
            ScalarKind::Long,
            ScalarKind::Double,
            ScalarKind::Boolean,
            ScalarKind::String,
        ];
        for dialect in Dialect::all() {
            for kind in core {
                assert!(native_type(*dialect, kind).is_some(), "{} lacks {}", dialect, kind);
            }
        }
    }

    #[test]
    fn test_list_support_is_per_dialect() {
        assert_eq!(native_type(Dialect::H2, ScalarKind::List), None);
        assert_eq!(native_type(Dialect::Sqlite, ScalarKind::List), Some("text"));
        assert_eq!(native_type(Dialect::MariaDb, ScalarKind::List), Some("json"));
        assert_eq!(native_type(Dialect::DuckDb, ScalarKind::List), Some("varchar[]"));
    }

    #[test]
    fn test_notable_native_names() {
        assert_eq!(native_type(Dialect::Postgres, ScalarKind::Double), Some("double precision"));
        assert_eq!(native_type(Dialect::Sqlite, ScalarKind::Boolean), Some("bit"));
        assert_eq!(native_type(Dialect::H2, ScalarKind::Byte), Some("tinyint"));
    }
}
