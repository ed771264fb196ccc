// PostgreSQLダイアレクトアダプター
//
// pg_catalog / information_schema からスキーマモデルを構築し、
// PostgreSQLの能力部分集合への正規化とスナップショット管理を行います。

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use sqlx::{AnyConnection, Row};

use crate::adapters::connection::{execute, quote_string_value, select_one};
use crate::adapters::dialect::{promote_surrogate_primary_key, DialectAdapter};
use crate::core::config::Dialect;
use crate::core::error::{DatabaseError, SyncError};
use crate::core::schema::{
    Column, ColumnFlags, ColumnType, Database, DefaultType, Key, KeyType, PrimaryKeyType, Table,
};

// PostgreSQLのインデックス名のハードコードされた上限
const POSTGRES_IDENTIFIER_LIMIT: usize = 63;

static COLUMN_LENGTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+)\)").expect("valid regex"));
static COLUMN_LENGTH_SCALE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\((\d+),(\d+)\)").expect("valid regex"));

/// PostgreSQL用アダプター
pub struct PostgresAdapter {
    conn: AnyConnection,
}

impl PostgresAdapter {
    /// 確立済みの接続からアダプターを作成
    pub fn new(conn: AnyConnection) -> Self {
        Self { conn }
    }

    async fn table_names(&mut self) -> Result<Vec<String>, SyncError> {
        let sql = r#"
            SELECT pg_class.relname
              FROM pg_class, pg_namespace
             WHERE pg_class.relnamespace = pg_namespace.oid AND
                   pg_namespace.nspname = ANY (current_schemas(false)) AND
                   relkind = 'r'
             ORDER BY relname
        "#;

        let rows = sqlx::query(sql)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::from_query(e, sql))?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn populate_columns(&mut self, table: &mut Table) -> Result<(), SyncError> {
        let sql = r#"
            SELECT attname, format_type(atttypid, atttypmod), attnotnull, atthasdef,
                   pg_get_expr(adbin, adrelid), attidentity::text
              FROM pg_attribute
              JOIN pg_class ON attrelid = pg_class.oid
              JOIN pg_type ON atttypid = pg_type.oid
              LEFT JOIN pg_attrdef ON adrelid = attrelid AND adnum = attnum
             WHERE attnum > 0 AND
                   NOT attisdropped AND
                   relname = $1
             ORDER BY attnum
        "#;

        let rows = sqlx::query(sql)
            .bind(&table.name)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::from_query(e, sql))?;

        for row in rows {
            let name: String = row.get(0);
            let db_type: String = row.get(1);
            let nullable = !row.get::<bool, _>(2);
            let has_default: bool = row.get(3);
            let raw_default: Option<String> = row.get(4);
            let identity: String = row.get(5);

            let (default_type, default_value) = match (has_default, raw_default) {
                (true, Some(raw)) => parse_column_default(&db_type, &raw),
                _ => (DefaultType::NoDefault, String::new()),
            };

            let mut column =
                classify_column(&name, &db_type, nullable, default_type, default_value);

            // IDENTITYカラムは暗黙のシーケンスから生成される
            match identity.as_str() {
                "a" => {
                    column.default_type = DefaultType::Sequence;
                    column.flags.identity_generated_always = true;
                }
                "d" => column.default_type = DefaultType::Sequence,
                _ => {}
            }

            table.columns.push(column);
        }

        Ok(())
    }

    async fn populate_primary_key(&mut self, table: &mut Table) -> Result<(), SyncError> {
        let sql = r#"
            SELECT kcu.column_name
              FROM information_schema.table_constraints tc
              JOIN information_schema.key_column_usage kcu
                ON kcu.table_name = tc.table_name AND
                   kcu.constraint_name = tc.constraint_name
             WHERE tc.table_name = $1 AND
                   tc.constraint_type = 'PRIMARY KEY'
             ORDER BY kcu.ordinal_position
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
            SELECT indexname, indisunique, attname
              FROM (SELECT table_class.oid AS table_oid, index_class.relname AS indexname,
                           pg_index.indisunique, generate_series(1, array_length(indkey, 1)) AS position,
                           unnest(indkey) AS attnum
                      FROM pg_class table_class, pg_class index_class, pg_index
                     WHERE table_class.relname = $1 AND
                           table_class.relkind = 'r' AND
                           index_class.relkind = 'i' AND
                           pg_index.indrelid = table_class.oid AND
                           pg_index.indexrelid = index_class.oid AND
                           NOT pg_index.indisprimary) index_attrs,
                   pg_attribute
             WHERE pg_attribute.attrelid = table_oid AND
                   pg_attribute.attnum = index_attrs.attnum
             ORDER BY indexname, index_attrs.position
        "#;

        let rows = sqlx::query(sql)
            .bind(&table.name)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DatabaseError::from_query(e, sql))?;

        for row in rows {
            let key_name: String = row.get(0);
            let unique: bool = row.get(1);
            let column_name: String = row.get(2);
            let column_index = table.index_of_column(&column_name)?;

            if table.keys.last().map(|key| key.name != key_name).unwrap_or(true) {
                let key_type = if unique {
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
impl DialectAdapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::PostgreSQL
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
        // postgresqlはトランザクショナルDDLを持つため、テーブルを見る前に
        // トランザクションを開始すれば完全に一貫したビューが得られる
        execute(
            &mut self.conn,
            "START TRANSACTION READ ONLY ISOLATION LEVEL REPEATABLE READ",
        )
        .await?;
        Ok(select_one(&mut self.conn, "SELECT pg_export_snapshot()").await?)
    }

    async fn import_snapshot(&mut self, snapshot: &str) -> Result<(), SyncError> {
        execute(
            &mut self.conn,
            "START TRANSACTION READ ONLY ISOLATION LEVEL REPEATABLE READ",
        )
        .await?;
        let sql = format!("SET TRANSACTION SNAPSHOT {}", quote_string_value(snapshot));
        Ok(execute(&mut self.conn, &sql).await?)
    }

    async fn unhold_snapshot(&mut self) -> Result<(), SyncError> {
        // 何もしない - mysqlのようなロックベースのエンジンでのみ必要
        Ok(())
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
        time_zone: true,
        identity_generated_always: true,
        ..ColumnFlags::default()
    }
}

fn normalize_database(mut database: Database) -> Database {
    for table in &mut database.tables {
        for column in &mut table.columns {
            if column.column_type == ColumnType::INT_UNSIGNED {
                // postgresqlは符号なしカラムをサポートしない。符号なしを使う
                // エンジンからの移行を容易にするため、拒否せず符号付きの等価型に
                // 変換し、不正な値の挿入時にエラーになることに任せる
                column.column_type = ColumnType::INT;
            }

            if column.column_type == ColumnType::INT && column.size == 1 {
                // postgresqlには無いサイズ。smallintが最も近い
                column.size = 2;
            }

            if column.column_type == ColumnType::INT && column.size == 3 {
                // postgresqlには無いサイズ。integerが最も近い
                column.size = 4;
            }

            if column.column_type == ColumnType::TEXT || column.column_type == ColumnType::BLOB {
                // postgresqlはTEXT/BLOBのサイズ違いを区別しない
                column.size = 0;
            }

            column.flags = column.flags.intersect(supported_flags());
        }

        for key in &mut table.keys {
            if key.name.len() >= POSTGRES_IDENTIFIER_LIMIT {
                key.name.truncate(POSTGRES_IDENTIFIER_LIMIT);
            }
        }
    }

    database
}

/// ネイティブ型文字列を閉じた型語彙へ分類する
///
/// 認識できない型はイントロスペクション時の失敗にせず、UNKNOWNとして
/// 元の型定義を保持します。そのカラムが実際に必要になった時点で
/// 意味のあるエラーを出すためです。
fn classify_column(
    name: &str,
    db_type: &str,
    nullable: bool,
    default_type: DefaultType,
    default_value: String,
) -> Column {
    let mut column = Column::new(name, ColumnType::TEXT, nullable);
    column.default_type = default_type;
    column.default_value = default_value;

    match db_type {
        "boolean" => column.column_type = ColumnType::BOOL,
        "smallint" => {
            column.column_type = ColumnType::INT;
            column.size = 2;
        }
        "integer" => {
            column.column_type = ColumnType::INT;
            column.size = 4;
        }
        "bigint" => {
            column.column_type = ColumnType::INT;
            column.size = 8;
        }
        "real" => {
            column.column_type = ColumnType::REAL;
            column.size = 4;
        }
        "double precision" => {
            column.column_type = ColumnType::REAL;
            column.size = 8;
        }
        "text" => column.column_type = ColumnType::TEXT,
        "bytea" => column.column_type = ColumnType::BLOB,
        "uuid" => column.column_type = ColumnType::UUID,
        "json" | "jsonb" => column.column_type = ColumnType::JSON,
        "date" => column.column_type = ColumnType::DATE,
        "time without time zone" => column.column_type = ColumnType::TIME,
        "time with time zone" => {
            column.column_type = ColumnType::TIME;
            column.flags.time_zone = true;
        }
        "timestamp without time zone" => column.column_type = ColumnType::DATETIME,
        "timestamp with time zone" => {
            column.column_type = ColumnType::DATETIME;
            column.flags.time_zone = true;
        }
        "geometry" => column.column_type = ColumnType::SPATIAL,
        _ => {
            if let Some(rest) = db_type.strip_prefix("numeric") {
                column.column_type = ColumnType::DECIMAL;
                if !rest.is_empty() {
                    column.size = extract_column_length(db_type);
                    column.scale = extract_column_scale(db_type);
                }
            } else if db_type.starts_with("character varying") {
                column.column_type = ColumnType::VARCHAR;
                // 長さ指定なしは「上限なし」の0のまま
                if db_type.ends_with(')') {
                    column.size = extract_column_length(db_type);
                }
            } else if db_type.starts_with("character(") {
                column.column_type = ColumnType::CHAR;
                column.size = extract_column_length(db_type);
            } else if let Some(parameters) = db_type
                .strip_prefix("geometry(")
                .and_then(|rest| rest.strip_suffix(')'))
            {
                let (type_restriction, reference_system) =
                    extract_spatial_type_restriction_and_reference_system(parameters);
                column.column_type = ColumnType::SPATIAL;
                column.type_restriction = type_restriction;
                column.reference_system = reference_system;
            } else {
                // 未対応の型。実際にそのカラムが必要になるまで拒否を遅延する
                column.column_type = ColumnType::UNKNOWN {
                    db_type_def: db_type.to_string(),
                };
            }
        }
    }

    column
}

/// pg_get_exprが返すデフォルト式を移植可能な形に分類する
fn parse_column_default(db_type: &str, raw: &str) -> (DefaultType, String) {
    if raw.len() > 20 && raw.starts_with("nextval('") && raw.ends_with("'::regclass)") {
        return (DefaultType::Sequence, String::new());
    }

    if let Some(cast_type) = raw.strip_prefix("NULL::") {
        if db_type.starts_with(cast_type) {
            // postgresqlはNULLデフォルトをデフォルトなしと区別するため、式として
            // 値を保持しつつ、移植性のため型変換部分は切り落とす
            return (DefaultType::DefaultExpression, "NULL".to_string());
        }
    }

    if raw.len() > 2 && raw.starts_with('\'') {
        if let Some(end) = raw.rfind('\'') {
            return (
                DefaultType::DefaultValue,
                unescape_default_literal(&raw[1..end]),
            );
        }
    }

    if !raw.is_empty()
        && raw != "false"
        && raw != "true"
        && raw.chars().any(|c| !c.is_ascii_digit() && c != '.')
    {
        // postgresqlはCURRENT_TIMESTAMPをnow()に変換する。移植性のため元に戻す
        let value = match raw {
            "now()" => "CURRENT_TIMESTAMP".to_string(),
            "('now'::text)::date" => "CURRENT_DATE".to_string(),
            // SQL予約の引数なし関数は引用符と括弧付きで返ってくる
            "\"current_schema\"()" | "\"current_user\"()" | "\"session_user\"()" => {
                raw[1..raw.len() - 3].to_string()
            }
            other => other.to_string(),
        };
        return (DefaultType::DefaultExpression, value);
    }

    (DefaultType::DefaultValue, raw.to_string())
}

// 完全なアンエスケープ関数ではなく、pg_get_exprの出力で観測された
// ケースのみを扱う。pgはこれらのデフォルト定義の出力で \t や \n の
// ような通常の文字エスケープを解釈しない
fn unescape_default_literal(escaped: &str) -> String {
    let mut result = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' || c == '\'' {
            if let Some(next) = chars.next() {
                result.push(next);
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn extract_column_length(db_type: &str) -> usize {
    COLUMN_LENGTH_SCALE_RE
        .captures(db_type)
        .or_else(|| COLUMN_LENGTH_RE.captures(db_type))
        .and_then(|captures| captures.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn extract_column_scale(db_type: &str) -> usize {
    COLUMN_LENGTH_SCALE_RE
        .captures(db_type)
        .and_then(|captures| captures.get(2))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

fn extract_spatial_type_restriction_and_reference_system(parameters: &str) -> (String, String) {
    let lowered = parameters.to_lowercase();

    match lowered.split_once(',') {
        None => (lowered, String::new()),
        Some((type_restriction, reference_system)) => {
            let type_restriction = if type_restriction == "geometry" {
                String::new()
            } else {
                type_restriction.to_string()
            };
            (type_restriction, reference_system.to_string())
        }
    }
}
