// スキーマドメインモデル
//
// データベースエンジンに依存しないスキーマ表現を提供する型システム。
// Database, Table, Column, Key などの値型と、比較に使う等価性・順序を定義します。

use serde::{Deserialize, Serialize};

use crate::core::error::SyncError;

/// カラム型
///
/// 比較器が扱う閉じた型語彙。各エンジンのアダプターはネイティブ型を
/// この語彙に分類してからスキーマを渡します。分類できなかった型は
/// `UNKNOWN` として元の型定義文字列を保持し、実際にそのカラムが
/// 必要になった時点で具体的なエラーを出せるようにします。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[allow(non_camel_case_types)]
pub enum ColumnType {
    BLOB,
    TEXT,
    VARCHAR,
    CHAR,
    JSON,
    UUID,
    BOOL,
    INT,
    INT_UNSIGNED,
    REAL,
    DECIMAL,
    DATE,
    TIME,
    DATETIME,
    SPATIAL,
    ENUM,
    UNKNOWN {
        /// 分類できなかったネイティブ型の定義文字列（そのまま保持）
        db_type_def: String,
    },
}

/// デフォルト値の種別
///
/// 名前でシリアライズされるため、列挙子の並びは変更可能です。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultType {
    /// デフォルトなし
    #[default]
    NoDefault,
    /// シーケンス生成（AUTO_INCREMENT, SERIAL, GENERATED AS IDENTITY）
    Sequence,
    /// リテラル値
    DefaultValue,
    /// 式
    DefaultExpression,
}

/// カラムの能力フラグ
///
/// フラグの集合は小さく固定なので、ビット集合ではなく名前付きの
/// 真偽値レコードとして表現します。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnFlags {
    /// MySQLのレガシーTIMESTAMP意味論を持つ
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mysql_timestamp: bool,

    /// ON UPDATE CURRENT_TIMESTAMP 付き
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mysql_on_update_timestamp: bool,

    /// タイムゾーン付きの時刻型
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub time_zone: bool,

    /// SRID等を持たない簡易ジオメトリ
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub simple_geometry: bool,

    /// GENERATED ALWAYS AS IDENTITY
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub identity_generated_always: bool,
}

impl ColumnFlags {
    /// 指定された能力集合との積を取る
    ///
    /// アダプターの正規化で、ローカルエンジンが表現できないフラグを
    /// 落とすために使います。
    pub fn intersect(self, supported: ColumnFlags) -> ColumnFlags {
        ColumnFlags {
            mysql_timestamp: self.mysql_timestamp && supported.mysql_timestamp,
            mysql_on_update_timestamp: self.mysql_on_update_timestamp
                && supported.mysql_on_update_timestamp,
            time_zone: self.time_zone && supported.time_zone,
            simple_geometry: self.simple_geometry && supported.simple_geometry,
            identity_generated_always: self.identity_generated_always
                && supported.identity_generated_always,
        }
    }

    /// いずれのフラグも立っていないかを返す
    pub fn is_empty(self) -> bool {
        self == ColumnFlags::default()
    }
}

/// カラム定義
///
/// `size`/`scale` の意味は型に依存します: INTならバイト幅、DECIMALなら
/// 精度/スケール、VARCHAR/CHARなら文字数上限。VARCHAR/TEXT/BLOBの0は
/// 「明示的な上限なし」を意味します。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    /// カラム名（テーブル内で一意）
    pub name: String,

    /// カラム型
    pub column_type: ColumnType,

    /// NULL許可フラグ
    pub nullable: bool,

    /// サイズ（型依存の意味）
    #[serde(default)]
    pub size: usize,

    /// スケール（DECIMALのみ）
    #[serde(default)]
    pub scale: usize,

    /// デフォルト値の種別
    #[serde(default)]
    pub default_type: DefaultType,

    /// デフォルト値（default_typeが値/式の場合のみ意味を持つ）
    #[serde(default)]
    pub default_value: String,

    /// 能力フラグ
    #[serde(default)]
    pub flags: ColumnFlags,

    /// 空間型の型制限（例: "point"）
    #[serde(default)]
    pub type_restriction: String,

    /// 空間参照系（SRID）
    #[serde(default)]
    pub reference_system: String,

    /// ENUM型の値リスト（定義順）
    #[serde(default)]
    pub enumeration_values: Vec<String>,

    // ローカルな行フィルター。シリアライズも比較もされません。
    #[serde(skip)]
    pub filter_expression: String,
}

impl Column {
    /// 新しいカラムを作成
    pub fn new(name: impl Into<String>, column_type: ColumnType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable,
            size: 0,
            scale: 0,
            default_type: DefaultType::NoDefault,
            default_value: String::new(),
            flags: ColumnFlags::default(),
            type_restriction: String::new(),
            reference_system: String::new(),
            enumeration_values: Vec::new(),
            filter_expression: String::new(),
        }
    }
}

impl PartialEq for Column {
    // filter_expression はローカル設定なので等価性から除外する
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.nullable == other.nullable
            && self.column_type == other.column_type
            && self.size == other.size
            && self.scale == other.scale
            && self.default_type == other.default_type
            && self.default_value == other.default_value
            && self.flags == other.flags
            && self.type_restriction == other.type_restriction
            && self.reference_system == other.reference_system
            && self.enumeration_values == other.enumeration_values
    }
}

impl Eq for Column {}

/// キー種別
///
/// ユニーク性は真偽値ではなく三値で表現します。空間インデックスは
/// ユニークキーとも通常キーとも異なる独立した種別です。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    UniqueKey,
    StandardKey,
    SpatialKey,
}

/// キー定義
///
/// `columns` はカラムインデックスの順序付きリストで、順序は
/// インデックスのカラム順を表すため意味を持ちます。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// キー名
    pub name: String,

    /// キー種別
    pub key_type: KeyType,

    /// 対象カラムのインデックスリスト（順序に意味あり）
    pub columns: Vec<usize>,
}

impl Key {
    /// 新しいキーを作成
    pub fn new(name: impl Into<String>, key_type: KeyType) -> Self {
        Self {
            name: name.into(),
            key_type,
            columns: Vec::new(),
        }
    }

    /// ユニークキーかどうか
    pub fn unique(&self) -> bool {
        self.key_type == KeyType::UniqueKey
    }

    /// 空間キーかどうか
    pub fn spatial(&self) -> bool {
        self.key_type == KeyType::SpatialKey
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    // 比較順序は (key_type, name)。columns は順序に関与しない
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key_type
            .cmp(&other.key_type)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// プライマリキー種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyType {
    /// 利用可能なキーなし
    #[default]
    NoAvailableKey,
    /// 明示的なプライマリキー
    ExplicitPrimaryKey,
    /// プライマリキー代替として昇格したユニークキー
    SuitableUniqueKey,
}

/// テーブル定義
///
/// カラムの宣言順は移植可能なスキーマ事実であり、そのまま保持されます。
/// キーは論理的には順序を持ちませんが、比較の前に (key_type, name) で
/// ソートして正規化します。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Table {
    /// テーブル名
    pub name: String,

    /// カラム定義のリスト（物理的な宣言順）
    pub columns: Vec<Column>,

    /// プライマリキーのカラムインデックス（序数順）
    #[serde(default)]
    pub primary_key_columns: Vec<usize>,

    /// プライマリキー種別
    #[serde(default)]
    pub primary_key_type: PrimaryKeyType,

    /// セカンダリキーのリスト
    #[serde(default)]
    pub keys: Vec<Key>,

    // ローカルな行フィルター。シリアライズも比較もされません。
    #[serde(skip)]
    pub where_conditions: String,
}

impl Table {
    /// 新しいテーブルを作成
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key_columns: Vec::new(),
            primary_key_type: PrimaryKeyType::NoAvailableKey,
            keys: Vec::new(),
            where_conditions: String::new(),
        }
    }

    /// 指定された名前のカラムのインデックスを取得
    ///
    /// カラムが存在しない場合は `SyncError::ColumnNotFound` を返します。
    pub fn index_of_column(&self, name: &str) -> Result<usize, SyncError> {
        self.columns
            .iter()
            .position(|column| column.name == name)
            .ok_or_else(|| SyncError::ColumnNotFound {
                table: self.name.clone(),
                column: name.to_string(),
            })
    }

    /// 明示的なプライマリキーのカラムインデックスを取得
    ///
    /// 代替ユニークキー（surrogate）はローカルな都合で選ばれたもので
    /// 移植可能なスキーマ事実ではないため、比較上は「プライマリキー
    /// なし」と同等に扱います。
    pub fn explicit_primary_key_columns(&self) -> &[usize] {
        if self.primary_key_type == PrimaryKeyType::ExplicitPrimaryKey {
            &self.primary_key_columns
        } else {
            &[]
        }
    }

    fn same_primary_key_as(&self, other: &Table) -> bool {
        self.explicit_primary_key_columns() == other.explicit_primary_key_columns()
    }
}

impl PartialEq for Table {
    // where_conditions はローカル設定なので等価性から除外する
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.columns == other.columns
            && self.same_primary_key_as(other)
            && self.keys == other.keys
    }
}

impl Eq for Table {}

impl PartialOrd for Table {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Table {
    // テーブルは名前のみでソートする
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// データベーススキーマ全体
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Database {
    /// テーブル定義のリスト
    pub tables: Vec<Table>,
}

impl Database {
    /// 新しい空のスキーマを作成
    pub fn new() -> Self {
        Self { tables: Vec::new() }
    }

    /// 名前でテーブルを検索する
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }
}
