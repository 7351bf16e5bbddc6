#[cfg(test)]
mod tests {
    use crate::{
        ConnectOptions, Connection, DataValue, DatacaveError, QueryOptions, SessionState,
    };
    use bytes::BytesMut;
    use datacave_core::{oid, ServerError};
    use datacave_protocol::backend::{encode_message, write_message};
    use datacave_protocol::frontend::{read_message, read_startup};
    use datacave_protocol::messages::{
        CloseTarget, DescribeTarget, RowDescriptionField, TransactionState,
    };
    use datacave_protocol::{BackendMessage, FrontendMessage};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::oneshot;

    const QUIET: Duration = Duration::from_millis(50);

    /// Server end of an in-memory connection, scripted by each test.
    struct MockServer {
        stream: DuplexStream,
    }

    impl MockServer {
        async fn startup(&mut self) -> HashMap<String, String> {
            match read_startup(&mut self.stream).await.expect("startup") {
                FrontendMessage::Startup { params } => params,
                other => panic!("expected startup, got {other:?}"),
            }
        }

        async fn accept(&mut self) {
            self.startup().await;
            self.send(&[
                BackendMessage::AuthenticationOk,
                BackendMessage::ParameterStatus {
                    key: "server_version".into(),
                    value: "16.2".into(),
                },
                BackendMessage::BackendKeyData { pid: 42, secret: 7 },
                ready(),
            ])
            .await;
        }

        async fn send(&mut self, messages: &[BackendMessage]) {
            for msg in messages {
                write_message(&mut self.stream, msg).await.expect("write");
            }
        }

        async fn recv(&mut self) -> FrontendMessage {
            read_message(&mut self.stream).await.expect("read")
        }

        async fn recv_sql(&mut self) -> String {
            match self.recv().await {
                FrontendMessage::Query { sql } => sql,
                other => panic!("expected query, got {other:?}"),
            }
        }

        /// True if the client sends nothing for `wait`.
        async fn is_silent(&mut self, wait: Duration) -> bool {
            tokio::time::timeout(wait, read_message(&mut self.stream))
                .await
                .is_err()
        }
    }

    fn ready() -> BackendMessage {
        BackendMessage::ReadyForQuery {
            state: TransactionState::Idle,
        }
    }

    fn number_rows(n: i64) -> Vec<BackendMessage> {
        vec![
            BackendMessage::RowDescription {
                fields: vec![RowDescriptionField::new("n", oid::INT4)],
            },
            BackendMessage::DataRow {
                values: vec![Some(n.to_string().into_bytes())],
            },
            BackendMessage::CommandComplete {
                tag: "SELECT 1".into(),
            },
            ready(),
        ]
    }

    fn options() -> ConnectOptions {
        ConnectOptions::default().with_query_timeout(Duration::from_secs(5))
    }

    async fn connected(options: ConnectOptions) -> (Connection, MockServer) {
        connected_over(64 * 1024, options).await
    }

    /// A statement far larger than the small test pipes can buffer.
    fn oversized_sql() -> String {
        format!("SELECT '{}'", "x".repeat(64 * 1024))
    }

    async fn connected_over(buffer: usize, options: ConnectOptions) -> (Connection, MockServer) {
        let (client, server) = tokio::io::duplex(buffer);
        let mut server = MockServer { stream: server };
        let (conn, handshake) = Connection::spawn_with_stream(client, options).expect("spawn");
        server.accept().await;
        handshake.wait().await.expect("handshake");
        (conn, server)
    }

    fn first_value(result: &datacave_core::QueryResult) -> &DataValue {
        &result.rows[0].values[0]
    }

    #[tokio::test]
    async fn handshake_publishes_server_parameters() {
        let (conn, _server) = connected(options()).await;
        assert_eq!(conn.state(), SessionState::Running);
        assert_eq!(conn.server_parameter("server_version").as_deref(), Some("16.2"));
        let key = conn.parameters().backend_key.expect("backend key");
        assert_eq!((key.process_id, key.secret), (42, 7));
    }

    #[tokio::test]
    async fn handshake_answers_cleartext_password() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = MockServer { stream: server };
        let options = options().with_user("app").with_password("secret");
        let (conn, handshake) = Connection::spawn_with_stream(client, options).expect("spawn");

        let params = server.startup().await;
        assert_eq!(params.get("user").map(String::as_str), Some("app"));
        server
            .send(&[BackendMessage::AuthenticationCleartextPassword])
            .await;
        assert_eq!(
            server.recv().await,
            FrontendMessage::Password {
                password: "secret".into()
            }
        );
        server.send(&[BackendMessage::AuthenticationOk, ready()]).await;

        handshake.wait().await.expect("handshake");
        assert_eq!(conn.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn rejected_handshake_fails_connect() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = MockServer { stream: server };
        let connect = tokio::spawn(Connection::connect_with_stream(client, options()));

        server.startup().await;
        server
            .send(&[BackendMessage::ErrorResponse(ServerError {
                severity: "FATAL".into(),
                ..ServerError::new("28P01", "password authentication failed")
            })])
            .await;

        match connect.await.expect("join") {
            Err(DatacaveError::Server(err)) => assert_eq!(err.code, "28P01"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_follow_submission_order_one_at_a_time() {
        let (conn, mut server) = connected(options()).await;

        let script = tokio::spawn(async move {
            for n in 1..=3 {
                assert_eq!(server.recv_sql().await, format!("SELECT {n}"));
                assert!(
                    server.is_silent(QUIET).await,
                    "next command sent before the reply"
                );
                server.send(&number_rows(n)).await;
            }
            server
        });

        let (first, second, third) = tokio::join!(
            conn.query("SELECT 1"),
            conn.query("SELECT 2"),
            conn.query("SELECT 3")
        );
        let _server = script.await.expect("script");

        assert_eq!(first_value(&first.expect("first")), &DataValue::Int64(1));
        assert_eq!(first_value(&second.expect("second")), &DataValue::Int64(2));
        assert_eq!(first_value(&third.expect("third")), &DataValue::Int64(3));
    }

    #[tokio::test]
    async fn split_reply_is_reassembled() {
        let (conn, mut server) = connected(options()).await;

        let script = tokio::spawn(async move {
            server.recv_sql().await;
            let mut buf = BytesMut::new();
            for msg in number_rows(7) {
                encode_message(&mut buf, &msg);
            }
            // Less than a header first, then the rest.
            server.stream.write_all(&buf[..3]).await.expect("head");
            server.stream.flush().await.expect("flush");
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.stream.write_all(&buf[3..]).await.expect("tail");
            server.stream.flush().await.expect("flush");
            server
        });

        let result = conn.query("SELECT 7").await.expect("query");
        let _server = script.await.expect("script");
        assert_eq!(first_value(&result), &DataValue::Int64(7));
        assert_eq!(result.rows_affected, 1);
    }

    #[tokio::test]
    async fn create_table_returns_empty_result() {
        let (conn, mut server) = connected(options()).await;
        let sql = "CREATE TABLE users (id INT, name TEXT)";

        let (result, _) = tokio::join!(conn.query(sql), async {
            assert_eq!(server.recv_sql().await, sql);
            server
                .send(&[
                    BackendMessage::CommandComplete {
                        tag: "CREATE TABLE".into(),
                    },
                    ready(),
                ])
                .await;
        });

        let result = result.expect("create");
        assert!(result.is_empty());
        assert_eq!(result.tag, "CREATE TABLE");
        assert_eq!(conn.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn parameters_are_bound_not_spliced() {
        let (conn, mut server) = connected(options()).await;
        let sql = "INSERT INTO users VALUES ($1, $2)";
        let params = [DataValue::Int64(1), DataValue::String("o'brien; DROP TABLE users".into())];

        let (result, _) = tokio::join!(
            conn.query_with(sql, &params, QueryOptions::default()),
            async {
                match server.recv().await {
                    FrontendMessage::Parse { query, .. } => assert_eq!(query, sql),
                    other => panic!("expected parse, got {other:?}"),
                }
                match server.recv().await {
                    FrontendMessage::Bind { param_values, .. } => assert_eq!(
                        param_values,
                        vec![
                            Some(b"1".to_vec()),
                            Some(b"o'brien; DROP TABLE users".to_vec())
                        ]
                    ),
                    other => panic!("expected bind, got {other:?}"),
                }
                assert!(matches!(
                    server.recv().await,
                    FrontendMessage::Describe {
                        target: DescribeTarget::Portal,
                        ..
                    }
                ));
                assert!(matches!(server.recv().await, FrontendMessage::Execute { .. }));
                assert_eq!(server.recv().await, FrontendMessage::Sync);
                server
                    .send(&[
                        BackendMessage::ParseComplete,
                        BackendMessage::BindComplete,
                        BackendMessage::NoData,
                        BackendMessage::CommandComplete {
                            tag: "INSERT 0 1".into(),
                        },
                        ready(),
                    ])
                    .await;
            }
        );

        assert_eq!(result.expect("insert").rows_affected, 1);
    }

    #[tokio::test]
    async fn server_error_keeps_connection_usable() {
        let (conn, mut server) = connected(options()).await;

        let (failed, _) = tokio::join!(conn.query("SELECT * FROM missing"), async {
            server.recv_sql().await;
            server
                .send(&[
                    BackendMessage::ErrorResponse(ServerError::new(
                        "42P01",
                        "relation \"missing\" does not exist",
                    )),
                    ready(),
                ])
                .await;
        });
        match failed {
            Err(DatacaveError::Server(err)) => assert_eq!(err.code, "42P01"),
            other => panic!("expected server error, got {other:?}"),
        }

        let (ok, _) = tokio::join!(conn.query("SELECT 1"), async {
            server.recv_sql().await;
            server.send(&number_rows(1)).await;
        });
        assert_eq!(first_value(&ok.expect("query")), &DataValue::Int64(1));
        assert_eq!(conn.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn queued_command_times_out_without_reaching_the_server() {
        let (conn, mut server) = connected(options()).await;

        let slow = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query("SELECT 1").await })
        };
        assert_eq!(server.recv_sql().await, "SELECT 1");

        let queued = conn
            .query_with("SELECT 2", &[], QueryOptions::with_timeout(Duration::from_millis(30)))
            .await;
        assert!(matches!(queued, Err(DatacaveError::Timeout(_))));

        server.send(&number_rows(1)).await;
        let slow = slow.await.expect("join").expect("slow query");
        assert_eq!(first_value(&slow), &DataValue::Int64(1));
        assert!(server.is_silent(QUIET).await, "timed-out command was sent");
        assert_eq!(conn.state(), SessionState::Running);

        let (next, _) = tokio::join!(conn.query("SELECT 3"), async {
            assert_eq!(server.recv_sql().await, "SELECT 3");
            server.send(&number_rows(3)).await;
        });
        assert_eq!(first_value(&next.expect("next")), &DataValue::Int64(3));
    }

    #[tokio::test]
    async fn in_flight_timeout_closes_the_connection() {
        let (conn, mut server) = connected(options()).await;

        let script = tokio::spawn(async move {
            server.recv_sql().await;
            server
        });
        let (timed_out, queued) = tokio::join!(
            conn.query_with(
                "SELECT pg_sleep(10)",
                &[],
                QueryOptions::with_timeout(Duration::from_millis(100))
            ),
            conn.query("SELECT 2")
        );
        let _server = script.await.expect("script");

        assert!(matches!(timed_out, Err(DatacaveError::Timeout(_))));
        assert!(matches!(queued, Err(DatacaveError::ConnectionClosed)));
        assert_eq!(conn.closed().await, SessionState::Error);
        assert!(matches!(
            conn.query("SELECT 3").await,
            Err(DatacaveError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn stop_discards_queued_commands() {
        let (conn, mut server) = connected(options()).await;

        let (first, second, goodbye) = tokio::join!(
            conn.query("SELECT 1"),
            conn.query("SELECT 2"),
            async {
                server.recv_sql().await;
                conn.stop().await.expect("stop");
                server.recv().await
            }
        );

        assert!(matches!(first, Err(DatacaveError::Discarded)));
        assert!(matches!(second, Err(DatacaveError::Discarded)));
        assert_eq!(goodbye, FrontendMessage::Terminate);
        assert_eq!(conn.state(), SessionState::Closed);
        conn.stop().await.expect("second stop");
    }

    #[tokio::test]
    async fn commands_submitted_during_handshake_wait_for_it() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut server = MockServer { stream: server };
        let (conn, handshake) = Connection::spawn_with_stream(client, options()).expect("spawn");

        let early = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query("SELECT 1").await })
        };
        server.startup().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.is_silent(QUIET).await, "query sent before handshake");

        server.send(&[BackendMessage::AuthenticationOk, ready()]).await;
        handshake.wait().await.expect("handshake");
        assert_eq!(server.recv_sql().await, "SELECT 1");
        server.send(&number_rows(1)).await;
        let result = early.await.expect("join").expect("early query");
        assert_eq!(first_value(&result), &DataValue::Int64(1));
    }

    #[tokio::test]
    async fn prepare_execute_and_close_statement() {
        let (conn, mut server) = connected(options()).await;
        let sql = "SELECT name FROM users WHERE id = $1";

        let (statement, _) = tokio::join!(conn.prepare(sql, &[]), async {
            match server.recv().await {
                FrontendMessage::Parse {
                    statement_name,
                    query,
                    ..
                } => {
                    assert_eq!(statement_name, "s1");
                    assert_eq!(query, sql);
                }
                other => panic!("expected parse, got {other:?}"),
            }
            assert_eq!(
                server.recv().await,
                FrontendMessage::Describe {
                    target: DescribeTarget::Statement,
                    name: "s1".into()
                }
            );
            assert_eq!(server.recv().await, FrontendMessage::Sync);
            server
                .send(&[
                    BackendMessage::ParseComplete,
                    BackendMessage::ParameterDescription {
                        type_oids: vec![oid::INT4],
                    },
                    BackendMessage::RowDescription {
                        fields: vec![RowDescriptionField::new("name", oid::TEXT)],
                    },
                    ready(),
                ])
                .await;
        });
        let statement = statement.expect("prepare");
        assert_eq!(statement.param_types(), &[oid::INT4]);

        let wrong = conn.execute(&statement, &[], QueryOptions::default()).await;
        assert!(matches!(wrong, Err(DatacaveError::Usage(_))));

        let (rows, _) = tokio::join!(
            conn.execute(&statement, &[DataValue::Int64(1)], QueryOptions::default()),
            async {
                match server.recv().await {
                    FrontendMessage::Bind { statement_name, .. } => assert_eq!(statement_name, "s1"),
                    other => panic!("expected bind, got {other:?}"),
                }
                for _ in 0..3 {
                    server.recv().await;
                }
                server
                    .send(&[
                        BackendMessage::BindComplete,
                        BackendMessage::RowDescription {
                            fields: vec![RowDescriptionField::new("name", oid::TEXT)],
                        },
                        BackendMessage::DataRow {
                            values: vec![Some(b"alice".to_vec())],
                        },
                        BackendMessage::CommandComplete {
                            tag: "SELECT 1".into(),
                        },
                        ready(),
                    ])
                    .await;
            }
        );
        let rows = rows.expect("execute");
        assert_eq!(first_value(&rows), &DataValue::String("alice".into()));

        let (closed, _) = tokio::join!(conn.close_statement(statement), async {
            assert_eq!(
                server.recv().await,
                FrontendMessage::Close {
                    target: CloseTarget::Statement,
                    name: "s1".into()
                }
            );
            assert_eq!(server.recv().await, FrontendMessage::Sync);
            server
                .send(&[BackendMessage::CloseComplete, ready()])
                .await;
        });
        closed.expect("close");
    }

    #[tokio::test]
    async fn notices_and_notifications_do_not_disturb_replies() {
        let (conn, mut server) = connected(options()).await;
        let mut notifications = conn.notifications();

        let (result, _) = tokio::join!(conn.query("LISTEN jobs"), async {
            server.recv_sql().await;
            server
                .send(&[
                    BackendMessage::NoticeResponse(ServerError {
                        severity: "NOTICE".into(),
                        ..ServerError::new("00000", "already listening")
                    }),
                    BackendMessage::NotificationResponse {
                        pid: 42,
                        channel: "jobs".into(),
                        payload: "ready".into(),
                    },
                    BackendMessage::ParameterStatus {
                        key: "TimeZone".into(),
                        value: "UTC".into(),
                    },
                    BackendMessage::CommandComplete {
                        tag: "LISTEN".into(),
                    },
                    ready(),
                ])
                .await;
        });

        assert_eq!(result.expect("listen").tag, "LISTEN");
        let note = notifications.recv().await.expect("notification");
        assert_eq!(note.channel, "jobs");
        assert_eq!(note.payload, "ready");
        assert_eq!(conn.server_parameter("TimeZone").as_deref(), Some("UTC"));
    }

    #[tokio::test]
    async fn peer_close_fails_pending_commands() {
        let (conn, mut server) = connected(options()).await;

        let (result, _) = tokio::join!(conn.query("SELECT 1"), async move {
            server.recv_sql().await;
            drop(server);
        });

        assert!(matches!(result, Err(DatacaveError::ConnectionClosed)));
        assert_eq!(conn.closed().await, SessionState::Error);
    }

    #[tokio::test]
    async fn unsolicited_message_is_a_protocol_failure() {
        let (conn, mut server) = connected(options()).await;
        server
            .send(&[BackendMessage::CommandComplete {
                tag: "SELECT 1".into(),
            }])
            .await;
        assert_eq!(conn.closed().await, SessionState::Error);
        let _server = server;
    }

    #[tokio::test]
    async fn dropping_every_handle_stops_the_actor() {
        let (conn, mut server) = connected(options()).await;
        drop(conn);
        assert_eq!(server.recv().await, FrontendMessage::Terminate);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_is_running_once_handshake_resolves() {
        for _ in 0..50 {
            let (conn, _server) = connected(options()).await;
            assert_eq!(conn.state(), SessionState::Running);
        }
    }

    #[tokio::test]
    async fn refused_connection_ends_in_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let options = ConnectOptions::new("127.0.0.1", port)
            .with_connect_timeout(Duration::from_secs(1));

        let (conn, handshake) = Connection::spawn(options.clone()).expect("spawn");
        assert!(matches!(handshake.wait().await, Err(DatacaveError::Transport(_))));
        assert_eq!(conn.closed().await, SessionState::Error);

        assert!(matches!(
            Connection::connect(options).await,
            Err(DatacaveError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn commands_queued_before_a_failed_open_see_the_connection_close() {
        let (release, gate) = oneshot::channel::<()>();
        let (conn, handshake) = Connection::start(
            async move {
                let _ = gate.await;
                Err::<DuplexStream, _>(DatacaveError::Transport("connection refused".into()))
            },
            options(),
        );

        let (queued, connected, _) = tokio::join!(conn.query("SELECT 1"), handshake.wait(), async {
            tokio::task::yield_now().await;
            let _ = release.send(());
        });

        assert!(matches!(queued, Err(DatacaveError::ConnectionClosed)));
        assert!(matches!(connected, Err(DatacaveError::Transport(_))));
        assert_eq!(conn.closed().await, SessionState::Error);
    }

    #[tokio::test]
    async fn deadline_fires_while_the_server_is_not_reading() {
        let (conn, _server) = connected_over(256, options()).await;

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            conn.query_with(
                &oversized_sql(),
                &[],
                QueryOptions::with_timeout(Duration::from_millis(100)),
            ),
        )
        .await
        .expect("deadline did not fire");

        assert!(matches!(result, Err(DatacaveError::Timeout(_))));
        assert_eq!(conn.closed().await, SessionState::Error);
    }

    #[tokio::test]
    async fn stop_is_prompt_while_the_server_is_not_reading() {
        let (conn, _server) = connected_over(256, options()).await;
        let sql = oversized_sql();

        let (stuck, _) = tokio::join!(conn.query(&sql), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::time::timeout(Duration::from_secs(1), conn.stop())
                .await
                .expect("stop did not return")
                .expect("stop");
        });

        assert!(matches!(stuck, Err(DatacaveError::Discarded)));
        assert_eq!(conn.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn unencodable_commands_are_rejected_before_sending() {
        let (conn, mut server) = connected(options()).await;

        assert!(matches!(
            conn.query("SELECT 1\0; DROP TABLE users").await,
            Err(DatacaveError::Usage(_))
        ));
        let params = vec![DataValue::Null; i16::MAX as usize + 1];
        assert!(matches!(
            conn.query_with("SELECT 1", &params, QueryOptions::default()).await,
            Err(DatacaveError::Usage(_))
        ));
        let param_types = vec![0; i16::MAX as usize + 1];
        assert!(matches!(
            conn.prepare("SELECT 1", &param_types).await,
            Err(DatacaveError::Usage(_))
        ));
        assert!(matches!(
            conn.prepare("SELECT $1\0", &[]).await,
            Err(DatacaveError::Usage(_))
        ));

        assert!(server.is_silent(QUIET).await, "rejected command was sent");
        assert_eq!(conn.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_connecting() {
        let options = options().with_parameter("user", "mallory");
        let (client, _server) = tokio::io::duplex(1024);
        assert!(matches!(
            Connection::spawn_with_stream(client, options),
            Err(DatacaveError::Config(_))
        ));
    }
}
