/// 同期オーケストレーターのテスト
///
/// このテストは、to側の状態機械をインメモリのパイプでfrom側
/// レスポンダー（またはスクリプト化したピア）と対向させ、正常系と
/// 中断系のセッション全体の流れを確認します。

#[cfg(test)]
mod sync_orchestrator_tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use syncline::adapters::dialect::DialectAdapter;
    use syncline::core::config::{Dialect, TableFilters};
    use syncline::core::error::{DatabaseError, SyncError};
    use syncline::core::protocol::Command;
    use syncline::core::schema::{Column, ColumnType, Database, PrimaryKeyType, Table};
    use syncline::services::schema_server::SchemaServer;
    use syncline::services::sync_orchestrator::{SnapshotRole, SyncOrchestrator, SyncState};
    use syncline::services::wire::CommandStream;

    type DuplexCommandStream = CommandStream<tokio::io::DuplexStream, tokio::io::DuplexStream>;

    /// テスト用のインメモリアダプター
    struct StubAdapter {
        database: Database,
        log: Arc<Mutex<Vec<String>>>,
        fail_commit: bool,
    }

    impl StubAdapter {
        fn new(database: Database) -> (Self, Arc<Mutex<Vec<String>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    database,
                    log: Arc::clone(&log),
                    fail_commit: false,
                },
                log,
            )
        }

        fn with_failing_commit(database: Database) -> (Self, Arc<Mutex<Vec<String>>>) {
            let (mut adapter, log) = Self::new(database);
            adapter.fail_commit = true;
            (adapter, log)
        }

        fn record(&self, entry: &str) {
            self.log.lock().unwrap().push(entry.to_string());
        }
    }

    #[async_trait]
    impl DialectAdapter for StubAdapter {
        fn dialect(&self) -> Dialect {
            Dialect::PostgreSQL
        }

        async fn populate_schema(&mut self) -> Result<Database, SyncError> {
            Ok(self.database.clone())
        }

        fn normalize_schema(&self, database: Database) -> Database {
            database
        }

        async fn export_snapshot(&mut self) -> Result<String, SyncError> {
            self.record("export");
            Ok("snapshot-1".to_string())
        }

        async fn import_snapshot(&mut self, snapshot: &str) -> Result<(), SyncError> {
            self.record(&format!("import {}", snapshot));
            Ok(())
        }

        async fn unhold_snapshot(&mut self) -> Result<(), SyncError> {
            self.record("unhold");
            Ok(())
        }

        async fn commit_transaction(&mut self) -> Result<(), SyncError> {
            self.record("commit");
            if self.fail_commit {
                return Err(DatabaseError::Transaction {
                    message: "connection lost during commit".to_string(),
                }
                .into());
            }
            Ok(())
        }

        async fn rollback_transaction(&mut self) -> Result<(), SyncError> {
            self.record("rollback");
            Ok(())
        }
    }

    fn stream_pair() -> (DuplexCommandStream, DuplexCommandStream) {
        let (near_reads, far_writes) = tokio::io::duplex(64 * 1024);
        let (far_reads, near_writes) = tokio::io::duplex(64 * 1024);
        (
            CommandStream::new(near_reads, near_writes),
            CommandStream::new(far_reads, far_writes),
        )
    }

    fn sample_database() -> Database {
        let mut users = Table::new("users");
        let mut id = Column::new("id", ColumnType::INT, false);
        id.size = 8;
        users.columns.push(id);
        let mut email = Column::new("email", ColumnType::VARCHAR, false);
        email.size = 255;
        users.columns.push(email);
        users.primary_key_columns = vec![0];
        users.primary_key_type = PrimaryKeyType::ExplicitPrimaryKey;

        Database { tables: vec![users] }
    }

    /// 一致するスキーマでのセッション全体の成功を確認
    #[tokio::test]
    async fn test_full_session_with_matching_schemas() {
        let (to_stream, from_stream) = stream_pair();

        let (to_adapter, to_log) = StubAdapter::new(sample_database());
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        let (from_adapter, from_log) = StubAdapter::new(sample_database());
        let mut server = SchemaServer::new(from_stream, Box::new(from_adapter));

        let (run_result, serve_result) =
            tokio::join!(orchestrator.run(SnapshotRole::Establish), server.serve());

        run_result.unwrap();
        serve_result.unwrap();

        assert_eq!(orchestrator.state(), SyncState::Ready);
        assert_eq!(orchestrator.version().unwrap().value(), 9);

        // 両端でスナップショットの確立と解放が一度ずつ行われる
        assert_eq!(*to_log.lock().unwrap(), vec!["export", "commit", "unhold"]);
        assert_eq!(*from_log.lock().unwrap(), vec!["export", "commit", "unhold"]);
    }

    /// 不一致のスキーマでセッションが中断されることを確認
    #[tokio::test]
    async fn test_mismatch_aborts_the_session() {
        let (to_stream, from_stream) = stream_pair();

        let mut local_database = sample_database();
        local_database.tables[0]
            .columns
            .push(Column::new("legacy", ColumnType::TEXT, true));

        let (to_adapter, to_log) = StubAdapter::new(local_database);
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        let (from_adapter, _from_log) = StubAdapter::new(sample_database());
        let mut server = SchemaServer::new(from_stream, Box::new(from_adapter));

        let (run_result, serve_result) =
            tokio::join!(orchestrator.run(SnapshotRole::Establish), server.serve());

        let error = run_result.unwrap_err();
        assert!(error.is_schema_mismatch());
        assert_eq!(error.to_string(), "Extra column legacy on table users");
        assert_eq!(orchestrator.state(), SyncState::Aborted);

        // 中断側はロールバックし、スナップショットは一度だけ解放される
        assert_eq!(*to_log.lock().unwrap(), vec!["export", "rollback", "unhold"]);

        // from側は中断をquitとして受け取り正常に終了する
        serve_result.unwrap();
    }

    /// フィルターで除外されたテーブルの差が無視されることを確認
    #[tokio::test]
    async fn test_filters_are_applied_to_the_comparison() {
        let (to_stream, from_stream) = stream_pair();

        let mut local_database = sample_database();
        let mut audit_log = Table::new("audit_log");
        audit_log.columns.push(Column::new("id", ColumnType::INT, false));
        local_database.tables.push(audit_log);

        let mut filters = TableFilters::default();
        filters.ignore_tables.insert("audit_log".to_string());

        let (to_adapter, _to_log) = StubAdapter::new(local_database);
        let mut orchestrator = SyncOrchestrator::new(to_stream, Box::new(to_adapter), filters);

        let (from_adapter, _from_log) = StubAdapter::new(sample_database());
        let mut server = SchemaServer::new(from_stream, Box::new(from_adapter));

        let (run_result, serve_result) =
            tokio::join!(orchestrator.run(SnapshotRole::Establish), server.serve());

        run_result.unwrap();
        serve_result.unwrap();
        assert_eq!(orchestrator.state(), SyncState::Ready);
    }

    /// スナップショット参加の役割を確認
    #[tokio::test]
    async fn test_joining_an_existing_snapshot() {
        let (to_stream, from_stream) = stream_pair();

        let (to_adapter, to_log) = StubAdapter::new(sample_database());
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        let (from_adapter, _from_log) = StubAdapter::new(sample_database());
        let mut server = SchemaServer::new(from_stream, Box::new(from_adapter));

        let role = SnapshotRole::Join("00000003-0000004B-1".to_string());
        let (run_result, serve_result) = tokio::join!(orchestrator.run(role), server.serve());

        run_result.unwrap();
        serve_result.unwrap();

        assert_eq!(
            *to_log.lock().unwrap(),
            vec!["import 00000003-0000004B-1", "commit", "unhold"]
        );
    }

    /// コミット失敗でもスナップショットが解放され終端状態に達することを確認
    ///
    /// 比較に合格した後のコミットが失敗した場合、セッションは中断として
    /// 後始末され、相手側をquitなしで待たせたままにしてはなりません。
    #[tokio::test]
    async fn test_commit_failure_still_tears_down_the_session() {
        let (to_stream, from_stream) = stream_pair();

        let (to_adapter, to_log) = StubAdapter::with_failing_commit(sample_database());
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        let (from_adapter, from_log) = StubAdapter::new(sample_database());
        let mut server = SchemaServer::new(from_stream, Box::new(from_adapter));

        let (run_result, serve_result) =
            tokio::join!(orchestrator.run(SnapshotRole::Establish), server.serve());

        let error = run_result.unwrap_err();
        assert_eq!(
            error.to_string(),
            "Transaction error: connection lost during commit"
        );
        assert_eq!(orchestrator.state(), SyncState::Aborted);

        // コミット失敗後もロールバックとスナップショット解放が一度だけ行われる
        assert_eq!(
            *to_log.lock().unwrap(),
            vec!["export", "commit", "rollback", "unhold"]
        );

        // from側はquitを受け取って正常に終了する
        serve_result.unwrap();
        assert_eq!(*from_log.lock().unwrap(), vec!["export", "commit", "unhold"]);
    }

    /// 古すぎるバージョンがスキーマ要求の前に拒否されることを確認
    #[tokio::test]
    async fn test_old_version_is_rejected_before_any_schema_command() {
        let (to_stream, mut peer) = stream_pair();

        let (to_adapter, to_log) = StubAdapter::new(sample_database());
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        let (run_result, _) = tokio::join!(orchestrator.run(SnapshotRole::Establish), async {
            // 古い実装のふりをして、バージョン6しか話せないと応答する
            let command = peer.read_command().await.unwrap();
            assert_eq!(command, Command::Protocol { version: 9 });
            peer.send_frame(&6i64).await.unwrap();

            // 次に来るのはスキーマ要求ではなくquitでなければならない
            let command = peer.read_command().await.unwrap();
            assert_eq!(command, Command::Quit);
        });

        let error = run_result.unwrap_err();
        assert!(error.is_unsupported_protocol());
        assert_eq!(orchestrator.state(), SyncState::Aborted);
        assert_eq!(*to_log.lock().unwrap(), vec!["export", "rollback", "unhold"]);
    }

    /// 交渉済みバージョンが通知されることを確認
    #[tokio::test]
    async fn test_negotiated_version_is_exposed() {
        let (to_stream, mut peer) = stream_pair();

        let (to_adapter, _to_log) = StubAdapter::new(sample_database());
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        assert_eq!(orchestrator.state(), SyncState::Start);
        assert!(orchestrator.version().is_none());

        let (negotiated, _) = tokio::join!(orchestrator.negotiate_version(), async {
            let _ = peer.read_command().await.unwrap();
            peer.send_frame(&8i64).await.unwrap();
        });

        let version = negotiated.unwrap();
        assert_eq!(version.value(), 8);
        assert!(version.supports_idle_command());
        assert!(!version.uses_blake3_hash());
        assert_eq!(orchestrator.state(), SyncState::VersionNegotiated);
    }

    /// キープアライブの往復を確認
    #[tokio::test]
    async fn test_keep_alive_round_trip() {
        let (to_stream, mut peer) = stream_pair();

        let (to_adapter, _to_log) = StubAdapter::new(sample_database());
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        let (result, _) = tokio::join!(
            async {
                orchestrator.negotiate_version().await?;
                orchestrator.keep_alive().await
            },
            async {
                let _ = peer.read_command().await.unwrap();
                peer.send_frame(&9i64).await.unwrap();

                let command = peer.read_command().await.unwrap();
                assert_eq!(command, Command::Idle);
                peer.send(&Command::Idle).await.unwrap();
            }
        );

        result.unwrap();
    }

    /// v7セッションではキープアライブが送信されないことを確認
    #[tokio::test]
    async fn test_keep_alive_is_a_no_op_on_v7() {
        let (to_stream, mut peer) = stream_pair();

        let (to_adapter, _to_log) = StubAdapter::new(sample_database());
        let mut orchestrator = SyncOrchestrator::new(
            to_stream,
            Box::new(to_adapter),
            TableFilters::default(),
        );

        let (result, _) = tokio::join!(
            async {
                orchestrator.negotiate_version().await?;
                orchestrator.keep_alive().await
            },
            async {
                let _ = peer.read_command().await.unwrap();
                peer.send_frame(&7i64).await.unwrap();
                // これ以上コマンドは来ない
            }
        );

        result.unwrap();
    }
}
