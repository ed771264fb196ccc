// Core Domain
// スキーマモデル、構造比較、プロトコル定義の純粋なビジネスロジック

pub mod config;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod schema_match;
