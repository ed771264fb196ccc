// Adapters
// データベースエンジンごとのイントロスペクションと正規化を抽象化

pub mod connection;
pub mod dialect;
pub mod mysql;
pub mod postgres;
