// Services
// ワイヤーフレーミングとハンドシェイクセッションの進行

pub mod schema_server;
pub mod sync_orchestrator;
pub mod wire;
