mod common;

#[cfg(test)]
mod tests {
    use super::common::*;
    use std::time::Duration;
    use vaas::{ConnectionOptions, ConnectionState, RequestContext, VaasError, Verdict};

    async fn wait_for_session_gone(vaas: &vaas::Vaas) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while vaas.session_id().is_some() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("session was never unpublished");
    }

    #[tokio::test]
    async fn test_loss_without_reconnect_fails_every_pending_request() -> anyhow::Result<()> {
        const K: u64 = 5;
        let (vaas, mut server) = client(ConnectionOptions {
            reconnect: false,
            ..test_options()
        });
        let mut conn = connect(&vaas, &mut server, SESSION).await;

        let mut calls = Vec::new();
        for i in 0..K {
            let vaas = vaas.clone();
            calls.push(tokio::spawn(async move {
                vaas.for_sha256(&sha(i), &RequestContext::default()).await
            }));
        }
        for _ in 0..K {
            conn.recv_json().await.expect("request");
        }
        drop(conn);

        for call in calls {
            assert!(matches!(call.await?, Err(VaasError::ConnectionLost(_))));
        }
        wait_for_state(&vaas, ConnectionState::Closed).await;
        assert_eq!(vaas.pending_requests(), 0);
        assert_eq!(server.connection_count(), 1);

        // The terminal error sticks for later callers
        assert!(matches!(
            vaas.for_sha256(&sha(9), &RequestContext::default()).await,
            Err(VaasError::ConnectionLost(_))
        ));
        vaas.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_list_call_reports_loss_per_position() -> anyhow::Result<()> {
        let (vaas, mut server) = client(ConnectionOptions {
            reconnect: false,
            ..test_options()
        });
        let mut conn = connect(&vaas, &mut server, SESSION).await;

        let hashes: Vec<_> = (0..3).map(sha).collect();
        let list = {
            let vaas = vaas.clone();
            let hashes = hashes.clone();
            tokio::spawn(async move { vaas.for_sha256_list(&hashes, &RequestContext::default()).await })
        };
        for _ in 0..hashes.len() {
            conn.recv_json().await.expect("request");
        }
        drop(conn);

        let verdicts = list.await?;
        assert_eq!(verdicts.len(), hashes.len());
        for (verdict, hash) in verdicts.iter().zip(&hashes) {
            assert_eq!(verdict.verdict, Verdict::Error);
            assert_eq!(verdict.sha256, hash.as_str());
            assert!(verdict.error_message.is_some());
        }
        vaas.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnects_with_new_session() -> anyhow::Result<()> {
        let (vaas, mut server) = client(test_options());
        let mut conn = connect(&vaas, &mut server, SESSION).await;
        assert_eq!(vaas.session_id().as_deref(), Some(SESSION));

        let in_flight = {
            let vaas = vaas.clone();
            tokio::spawn(async move { vaas.for_sha256(&sha(1), &RequestContext::default()).await })
        };
        conn.recv_json().await.expect("request");
        drop(conn);

        // In-flight requests are failed, not replayed
        assert!(matches!(in_flight.await?, Err(VaasError::ConnectionLost(_))));

        let mut conn = server.accept().await.expect("reconnect");
        let token = conn.accept_auth("session-2").await.expect("auth request");
        assert_eq!(token, "token");
        wait_for_state(&vaas, ConnectionState::Ready).await;
        assert_eq!(vaas.session_id().as_deref(), Some("session-2"));
        assert_eq!(server.connection_count(), 2);

        let served = serve(conn, |request| {
            assert_eq!(request["session_id"], "session-2");
            verdict_response(request, "Clean")
        });
        let verdict = vaas.for_sha256(&sha(2), &RequestContext::default()).await?;
        assert_eq!(verdict.verdict, Verdict::Clean);

        vaas.close().await?;
        assert_eq!(served.await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_call_waits_through_reconnect_gap() -> anyhow::Result<()> {
        let (vaas, mut server) = client(test_options());
        let conn = connect(&vaas, &mut server, SESSION).await;
        drop(conn);
        wait_for_session_gone(&vaas).await;

        let call = {
            let vaas = vaas.clone();
            tokio::spawn(async move { vaas.for_sha256(&sha(4), &RequestContext::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!call.is_finished());

        let mut conn = server.accept().await.expect("reconnect");
        conn.accept_auth("session-2").await.expect("auth request");
        let served = serve(conn, |request| verdict_response(request, "Pup"));

        assert_eq!(call.await??.verdict, Verdict::Pup);
        vaas.close().await?;
        served.await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_waiting_call_honours_its_deadline() -> anyhow::Result<()> {
        let (vaas, mut server) = client(test_options());
        let conn = connect(&vaas, &mut server, SESSION).await;
        drop(conn);
        wait_for_session_gone(&vaas).await;

        let ctx = RequestContext::with_timeout(Duration::from_millis(50));
        assert!(matches!(
            vaas.for_sha256(&sha(4), &ctx).await,
            Err(VaasError::Timeout)
        ));
        assert_eq!(vaas.pending_requests(), 0);

        vaas.close().await?;
        assert_eq!(vaas.state(), ConnectionState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn test_auth_rejected_on_reconnect_is_terminal() -> anyhow::Result<()> {
        let (vaas, mut server) = client(test_options());
        let conn = connect(&vaas, &mut server, SESSION).await;
        drop(conn);

        let mut conn = server.accept().await.expect("reconnect");
        conn.reject_auth("token revoked").await.expect("auth request");
        wait_for_state(&vaas, ConnectionState::Closed).await;

        match vaas.for_sha256(&sha(1), &RequestContext::default()).await {
            Err(VaasError::AuthenticationFailed(reason)) => assert_eq!(reason, "token revoked"),
            other => panic!("expected authentication failure, got {:?}", other),
        }
        vaas.close().await?;
        assert_eq!(server.connection_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_server_close_is_recovered() -> anyhow::Result<()> {
        let (vaas, mut server) = client(test_options());
        let conn = connect(&vaas, &mut server, SESSION).await;
        conn.close(1000);

        let mut conn = server.accept().await.expect("reconnect");
        conn.accept_auth("session-2").await.expect("auth request");
        wait_for_state(&vaas, ConnectionState::Ready).await;
        assert_eq!(vaas.session_id().as_deref(), Some("session-2"));

        let served = drain(conn);
        vaas.close().await?;
        assert!(served.await?.is_empty());
        Ok(())
    }
}
