// MySQLダイアレクトアダプター
//
// information_schema からスキーマモデルを構築し、MySQLの能力部分集合への
// 正規化とロックベースのスナップショット管理を行います。

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sqlx::{AnyConnection, Row};

use crate::adapters::connection::execute;
use crate::adapters::dialect::{promote_surrogate_primary_key, DialectAdapter};
use crate::core::config::Dialect;
use crate::core::error::{DatabaseError, SyncError};
use crate::core::schema::{
    Column, ColumnFlags, ColumnType, Database, DefaultType, Key, KeyType, PrimaryKeyType, Table,
};

// MySQLのインデックス名のハードコードされた上限
const MYSQL_IDENTIFIER_LIMIT: usize = 64;

static COLUMN_LENGTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+)\)").expect("valid regex"));
static COLUMN_LENGTH_SCALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+),(\d+)\)").expect("valid regex"));
static ENUM_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'((?:[^']|'')*)'").expect("valid regex"));

/// MySQL用アダプター
pub struct MySqlAdapter {
    conn: AnyConnection,
}

impl MySqlAdapter {
    /// 確立済みの接続からアダプターを作成
    pub fn new(conn: AnyConnection) -> Self {
        Self { conn }
    }

    async fn table_names(&mut self) -> Result<Vec<String>, SyncError> {
        let sql = r#"
            SELECT table_name
              FROM information_schema.tables
             WHERE table_schema = DATABASE() AND
                   table_type = 'BASE TABLE'
             ORDER BY table_name
        "#;

        let rows = sqlx::query(sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::from_query(e, sql))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn populate_columns(&mut self, table: &mut Table) -> Result<(), SyncError> {
        // column_typeは "int unsigned" や "enum('a','b')" のような完全な
        // 型テキストを持つため、data_typeではなくこちらを分類に使う
        let sql = r#"
            SELECT column_name, column_type, is_nullable, column_default, extra
              FROM information_schema.columns
             WHERE table_name = ? AND table_schema = DATABASE()
             ORDER BY ordinal_position
        "#;

        let rows = sqlx::query(sql)
            .bind(&table.name)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::from_query(e, sql))?;

        for row in rows {
            let name: String = row.get(0);
            let column_type: String = row.get(1);
            let nullable = row.get::<String, _>(2) == "YES";
            let raw_default: Option<String> = row.get(3);
            let extra: String = row.get(4);

            table
                .columns
                .push(classify_column(&name, &column_type, nullable, raw_default, &extra));
        }

        Ok(())
    }

    async fn populate_primary_key(&mut self, table: &mut Table) -> Result<(), SyncError> {
        let sql = r#"
            SELECT column_name
              FROM information_schema.statistics
             WHERE table_name = ? AND table_schema = DATABASE() AND
                   index_name = 'PRIMARY'
             ORDER BY seq_in_index
        "#;

        let rows = sqlx::query(sql)
            .bind(&table.name)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::from_query(e, sql))?;

        for row in rows {
            let column_name: String = row.get(0);
            let column_index = table.index_of_column(&column_name)?;
            table.primary_key_columns.push(column_index);
            table.primary_key_type = PrimaryKeyType::ExplicitPrimaryKey;
        }

        Ok(())
    }

    async fn populate_keys(&mut self, table: &mut Table) -> Result<(), SyncError> {
        let sql = r#"
            SELECT index_name, non_unique, index_type, column_name
              FROM information_schema.statistics
             WHERE table_name = ? AND table_schema = DATABASE() AND
                   index_name != 'PRIMARY'
             ORDER BY index_name, seq_in_index
        "#;

        let rows = sqlx::query(sql)
            .bind(&table.name)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::from_query(e, sql))?;

        for row in rows {
            let key_name: String = row.get(0);
            let non_unique: i64 = row.get(1);
            let index_type: String = row.get(2);
            let column_name: String = row.get(3);
            let column_index = table.index_of_column(&column_name)?;

            if table.keys.last().map(|key| key.name != key_name).unwrap_or(true) {
                let key_type = if index_type == "SPATIAL" {
                    KeyType::SpatialKey
                } else if non_unique == 0 {
                    KeyType::UniqueKey
                } else {
                    KeyType::StandardKey
                };
                table.keys.push(Key::new(key_name, key_type));
            }
            if let Some(key) = table.keys.last_mut() {
                key.columns.push(column_index);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl DialectAdapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::MySQL
    }

    async fn populate_schema(&mut self) -> Result<Database, SyncError> {
        let mut database = Database::new();

        for table_name in self.table_names().await? {
            let mut table = Table::new(table_name);
            self.populate_columns(&mut table).await?;
            self.populate_primary_key(&mut table).await?;
            self.populate_keys(&mut table).await?;

            // キーの順序は任意だが、両端で一貫している必要があるため名前でソートする
            table.keys.sort();
            promote_surrogate_primary_key(&mut table);

            database.tables.push(table);
        }

        Ok(database)
    }

    fn normalize_schema(&self, database: Database) -> Database {
        normalize_database(database)
    }

    async fn export_snapshot(&mut self) -> Result<String, SyncError> {
        // mysqlはトランザクショナルDDLを持たないため、グローバルリードロックで
        // スキーマを固定してから一貫スナップショットを取る。ロックは
        // unhold_snapshotまで保持される
        execute(&mut self.conn, "FLUSH TABLES WITH READ LOCK").await?;
        execute(&mut self.conn, "START TRANSACTION WITH CONSISTENT SNAPSHOT").await?;

        // mysqlにはpostgresqlのような共有可能なスナップショット識別子が無く、
        // 参加側は各自で一貫スナップショットを開く
        Ok(String::new())
    }

    async fn import_snapshot(&mut self, _snapshot: &str) -> Result<(), SyncError> {
        Ok(execute(&mut self.conn, "START TRANSACTION WITH CONSISTENT SNAPSHOT").await?)
    }

    async fn unhold_snapshot(&mut self) -> Result<(), SyncError> {
        Ok(execute(&mut self.conn, "UNLOCK TABLES").await?)
    }

    async fn commit_transaction(&mut self) -> Result<(), SyncError> {
        Ok(execute(&mut self.conn, "COMMIT").await?)
    }

    async fn rollback_transaction(&mut self) -> Result<(), SyncError> {
        Ok(execute(&mut self.conn, "ROLLBACK").await?)
    }
}

fn supported_flags() -> ColumnFlags {
    ColumnFlags {
        mysql_timestamp: true,
        mysql_on_update_timestamp: true,
        simple_geometry: true,
        ..ColumnFlags::default()
    }
}

fn normalize_database(mut database: Database) -> Database {
    for table in &mut database.tables {
        for column in &mut table.columns {
            if column.column_type == ColumnType::UUID {
                // mysqlにはネイティブのUUID型が無い。慣例通り固定長文字列で表現する
                column.column_type = ColumnType::CHAR;
                column.size = 36;
            }

            if column.column_type == ColumnType::BOOL {
                // mysqlのBOOLEANはtinyint(1)の別名にすぎない
                column.column_type = ColumnType::INT;
                column.size = 1;
            }

            column.flags = column.flags.intersect(supported_flags());
        }

        for key in &mut table.keys {
            if key.name.len() >= MYSQL_IDENTIFIER_LIMIT {
                key.name.truncate(MYSQL_IDENTIFIER_LIMIT);
            }
        }
    }

    database
}

/// ネイティブ型文字列を閉じた型語彙へ分類する
///
/// information_schemaのcolumn_type（"bigint unsigned" や "varchar(255)" の
/// ような完全な型テキスト）を受け取ります。認識できない型は失敗ではなく
/// UNKNOWNとして元の定義を保持します。
fn classify_column(
    name: &str,
    column_type: &str,
    nullable: bool,
    raw_default: Option<String>,
    extra: &str,
) -> Column {
    let mut column = Column::new(name, ColumnType::TEXT, nullable);
    let unsigned = column_type.contains("unsigned");
    let base_type = column_type
        .split(|c| c == '(' || c == ' ')
        .next()
        .unwrap_or(column_type);

    match base_type {
        "tinyint" => {
            // tinyint(1)はBOOLEANの慣用表現だが、実体は1バイト整数なので
            // 整数として取り込む
            column.column_type = integer_type(unsigned);
            column.size = 1;
        }
        "smallint" => {
            column.column_type = integer_type(unsigned);
            column.size = 2;
        }
        "mediumint" => {
            column.column_type = integer_type(unsigned);
            column.size = 3;
        }
        "int" => {
            column.column_type = integer_type(unsigned);
            column.size = 4;
        }
        "bigint" => {
            column.column_type = integer_type(unsigned);
            column.size = 8;
        }
        "float" => {
            column.column_type = ColumnType::REAL;
            column.size = 4;
        }
        "double" => {
            column.column_type = ColumnType::REAL;
            column.size = 8;
        }
        "decimal" => {
            column.column_type = ColumnType::DECIMAL;
            column.size = extract_column_length(column_type);
            column.scale = extract_column_scale(column_type);
        }
        "varchar" => {
            column.column_type = ColumnType::VARCHAR;
            column.size = extract_column_length(column_type);
        }
        "char" => {
            column.column_type = ColumnType::CHAR;
            column.size = extract_column_length(column_type);
        }
        "tinytext" | "text" | "mediumtext" | "longtext" => {
            column.column_type = ColumnType::TEXT;
            column.size = sized_lob_limit(base_type);
        }
        "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            column.column_type = ColumnType::BLOB;
            column.size = sized_lob_limit(base_type);
        }
        "binary" | "varbinary" => {
            column.column_type = ColumnType::BLOB;
            column.size = extract_column_length(column_type);
        }
        "enum" => {
            column.column_type = ColumnType::ENUM;
            column.enumeration_values = extract_enumeration_values(column_type);
        }
        "json" => column.column_type = ColumnType::JSON,
        "date" => column.column_type = ColumnType::DATE,
        "time" => column.column_type = ColumnType::TIME,
        "datetime" => column.column_type = ColumnType::DATETIME,
        "timestamp" => {
            // mysqlのtimestampはUTC格納・ゼロ値禁止など独自の意味論を持つため
            // フラグで区別する
            column.column_type = ColumnType::DATETIME;
            column.flags.mysql_timestamp = true;
        }
        "geometry" | "point" | "linestring" | "polygon" | "multipoint" | "multilinestring"
        | "multipolygon" | "geometrycollection" => {
            column.column_type = ColumnType::SPATIAL;
            column.flags.simple_geometry = true;
            if base_type != "geometry" {
                column.type_restriction = base_type.to_string();
            }
        }
        _ => {
            column.column_type = ColumnType::UNKNOWN {
                db_type_def: column_type.to_string(),
            };
        }
    }

    if extra.contains("on update CURRENT_TIMESTAMP") {
        column.flags.mysql_on_update_timestamp = true;
    }

    let (default_type, default_value) = parse_column_default(raw_default, extra);
    column.default_type = default_type;
    column.default_value = default_value;

    column
}

fn integer_type(unsigned: bool) -> ColumnType {
    if unsigned {
        ColumnType::INT_UNSIGNED
    } else {
        ColumnType::INT
    }
}

fn sized_lob_limit(base_type: &str) -> usize {
    match base_type {
        "tinytext" | "tinyblob" => 255,
        "text" | "blob" => 65535,
        "mediumtext" | "mediumblob" => 16777215,
        // long系は4GBで事実上の無制限。0は「明示上限なし」を表す
        _ => 0,
    }
}

/// information_schemaのcolumn_default/extraをデフォルト種別へ分類する
fn parse_column_default(raw_default: Option<String>, extra: &str) -> (DefaultType, String) {
    if extra.contains("auto_increment") {
        return (DefaultType::Sequence, String::new());
    }

    let raw = match raw_default {
        None => return (DefaultType::NoDefault, String::new()),
        Some(raw) => raw,
    };

    // mysql 8はリテラル以外のデフォルトにDEFAULT_GENERATEDを付ける
    if extra.contains("DEFAULT_GENERATED") {
        return (DefaultType::DefaultExpression, raw);
    }

    if raw == "CURRENT_TIMESTAMP" || raw.starts_with("CURRENT_TIMESTAMP(") {
        return (DefaultType::DefaultExpression, raw);
    }

    (DefaultType::DefaultValue, raw)
}

fn extract_column_length(column_type: &str) -> usize {
    COLUMN_LENGTH_SCALE_RE
        .captures(column_type)
        .or_else(|| COLUMN_LENGTH_RE.captures(column_type))
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn extract_column_scale(column_type: &str) -> usize {
    COLUMN_LENGTH_SCALE_RE
        .captures(column_type)
        .and_then(|captures| captures.get(2))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn extract_enumeration_values(column_type: &str) -> Vec<String> {
    ENUM_VALUE_RE
        .captures_iter(column_type)
        .filter_map(|captures| captures.get(1))
        .map(|m| m.as_str().replace("''", "'"))
        .collect()
}
