// Synclineライブラリのエントリーポイント
//
// モジュール構造:
// - cli: CLIレイヤー（ユーザー入力の受付とコマンドルーティング）
// - core: コアドメインロジック（スキーマモデル、構造比較、プロトコル定義）
// - adapters: データベースエンジンごとのイントロスペクションと正規化
// - services: ワイヤーフレーミングとハンドシェイクの進行

pub mod cli;
pub mod core;
pub mod adapters;
pub mod services;
