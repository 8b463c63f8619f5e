use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use faids::channel::SecureChannel;
use faids::credentials::StaticCredentials;
use faids::message::{FileMetadata, Request, ServerMessage, TransferRequest};
use faids::negotiation::Outcome;
use faids::protocol::DEFAULT_MAX_FRAME_SIZE;
use faids::{serve_connection, Client, Limits, RelayContext, RelayError};
use tokio::io::duplex;
use tokio::time::timeout;

const MIB: u64 = 1024 * 1024;

fn addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn relay() -> Arc<RelayContext> {
    let store = StaticCredentials::default()
        .with_user("alice", "secret")
        .with_user("bob", "hunter2");
    RelayContext::new(Arc::new(store), Limits::default())
}

fn spawn_connection(ctx: &Arc<RelayContext>) -> tokio::io::DuplexStream {
    let (server_side, client_side) = duplex(256 * 1024);
    tokio::spawn(serve_connection(server_side, addr(), Arc::clone(ctx)));
    client_side
}

async fn connect(ctx: &Arc<RelayContext>, user: &str, password: &str) -> Client {
    let mut client = Client::new(spawn_connection(ctx), addr());
    client.login(user, password).await.unwrap();
    client
}

async fn wait_ready(ctx: &RelayContext, user: &str) {
    for _ in 0..200 {
        if ctx.registry.lookup(user).is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{user} never became ready");
}

fn write_pattern(path: &Path, size: u64) -> Result<()> {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    std::fs::write(path, data)?;
    Ok(())
}

#[tokio::test]
async fn login_and_presence() {
    let ctx = relay();

    let mut eve = Client::new(spawn_connection(&ctx), addr());
    let err = eve.login("alice", "nope").await.unwrap_err();
    assert!(matches!(err, RelayError::AuthFailure(_)), "{err:?}");

    let alice = connect(&ctx, "alice", "secret").await;
    assert_eq!(alice.username(), Some("alice"));
    let mut bob = connect(&ctx, "bob", "hunter2").await;

    assert!(bob.ready_users().await.unwrap().is_empty());
    alice.mark_ready().await.unwrap();
    wait_ready(&ctx, "alice").await;
    assert_eq!(bob.ready_users().await.unwrap(), vec!["alice".to_string()]);

    alice.mark_unready().await.unwrap();
    for _ in 0..200 {
        if ctx.registry.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(bob.ready_users().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ten_megabytes_reach_the_recipient_intact() -> Result<()> {
    let ctx = relay();
    let src_dir = tempfile::tempdir()?;
    let dst_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("report.pdf");
    write_pattern(&src, 10 * MIB)?;

    let mut alice = connect(&ctx, "alice", "secret").await;
    let mut bob = connect(&ctx, "bob", "hunter2").await;

    let dest_root = dst_dir.path().to_path_buf();
    let receiver = tokio::spawn(async move {
        alice.mark_ready().await.unwrap();
        let offer = alice.next_offer().await.unwrap();
        assert_eq!(offer.from_user, "bob");
        assert_eq!(offer.file_name, "report.pdf");
        let mut last = 0;
        let res = alice.accept(&dest_root, |n, total| {
            assert_eq!(total, 10 * MIB);
            last = n;
        })
        .await;
        (res, last)
    });

    wait_ready(&ctx, "alice").await;
    let mut sent = 0;
    let report = bob.send_file("alice", &src, |n| sent = n).await.unwrap();
    assert!(report.complete);
    assert_eq!(report.transferred, 10 * MIB);
    assert_eq!(sent, 10 * MIB);

    let (res, last) = receiver.await?;
    let (path, report) = res.unwrap();
    assert!(report.complete);
    assert_eq!(report.expected, 10 * MIB);
    assert_eq!(last, 10 * MIB);
    assert_eq!(path, dst_dir.path().join("report.pdf"));
    assert_eq!(std::fs::read(&path)?, std::fs::read(&src)?);

    // Accepting took alice out of the ready set
    assert!(ctx.registry.lookup("alice").is_none());
    Ok(())
}

#[tokio::test]
async fn declined_offer_leaves_the_target_ready() -> Result<()> {
    let ctx = relay();
    let src_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("notes.txt");
    write_pattern(&src, 1024)?;

    let mut alice = connect(&ctx, "alice", "secret").await;
    let mut bob = connect(&ctx, "bob", "hunter2").await;
    alice.mark_ready().await?;
    wait_ready(&ctx, "alice").await;

    let receiver = tokio::spawn(async move {
        let offer = alice.next_offer().await.unwrap();
        assert_eq!(offer.file_name, "notes.txt");
        alice.decline().await.unwrap();
        alice
    });

    let err = bob.send_file("alice", &src, |_| {}).await.unwrap_err();
    assert!(matches!(err, RelayError::NegotiationFailure(Outcome::Declined)), "{err:?}");
    let _alice = receiver.await?;
    assert!(ctx.registry.lookup("alice").is_some());
    Ok(())
}

#[tokio::test]
async fn target_not_ready_is_never_contacted() -> Result<()> {
    let ctx = relay();
    let src_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("a.bin");
    write_pattern(&src, 16)?;

    let mut alice = connect(&ctx, "alice", "secret").await;
    let mut bob = connect(&ctx, "bob", "hunter2").await;

    let err = bob.send_file("alice", &src, |_| {}).await.unwrap_err();
    assert!(matches!(err, RelayError::NegotiationFailure(_)), "{err:?}");
    assert!(timeout(Duration::from_millis(200), alice.next_offer()).await.is_err());

    // Nor is anyone who never logged in
    let err = bob.send_file("carol", &src, |_| {}).await.unwrap_err();
    assert!(matches!(err, RelayError::NegotiationFailure(_)), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn target_leaving_mid_negotiation_fails_fast() -> Result<()> {
    let ctx = relay();
    let src_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("a.bin");
    write_pattern(&src, 16)?;

    let mut alice = connect(&ctx, "alice", "secret").await;
    let mut bob = connect(&ctx, "bob", "hunter2").await;
    alice.mark_ready().await?;
    wait_ready(&ctx, "alice").await;

    let receiver = tokio::spawn(async move {
        alice.next_offer().await.unwrap();
        alice.close().await;
    });

    // Well inside the relay's 60 second negotiation window
    let res = timeout(Duration::from_secs(5), bob.send_file("alice", &src, |_| {})).await?;
    assert!(matches!(res, Err(RelayError::NegotiationFailure(_))), "{res:?}");
    receiver.await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sender_vanishing_mid_stream_is_reported_to_the_recipient() -> Result<()> {
    let ctx = relay();
    let dst_dir = tempfile::tempdir()?;

    let mut alice = connect(&ctx, "alice", "secret").await;
    alice.mark_ready().await?;
    wait_ready(&ctx, "alice").await;

    let dest_root = dst_dir.path().to_path_buf();
    let receiver = tokio::spawn(async move {
        alice.next_offer().await.unwrap();
        alice.accept(&dest_root, |_, _| {}).await
    });

    // Raw sender so the stream can be cut at an exact offset
    let mut bob = SecureChannel::new(spawn_connection(&ctx), addr(), DEFAULT_MAX_FRAME_SIZE);
    let login = Request::Login { username: "bob".into(), password: "hunter2".into() };
    bob.send_envelope(&login.into_envelope()).await?;
    assert_eq!(ServerMessage::parse(&bob.read_envelope().await?)?, ServerMessage::LoginResult(true));

    let req = TransferRequest {
        from_user: "bob".into(),
        to_user: "alice".into(),
        filename: "big.iso".into(),
    };
    bob.send_envelope(&Request::SendRequest(req).into_envelope()).await?;
    assert_eq!(ServerMessage::parse(&bob.read_envelope().await?)?, ServerMessage::GoAhead(Some(true)));

    let meta = FileMetadata { filename: "big.iso".into(), filesize: 10 * MIB };
    bob.send_envelope(&Request::Metadata(meta).into_envelope()).await?;
    let chunk = vec![7u8; 64 * 1024];
    for _ in 0..(4 * MIB / chunk.len() as u64) {
        bob.send(&chunk).await?;
    }
    drop(bob);

    let res = timeout(Duration::from_secs(10), receiver).await??;
    match res {
        Err(RelayError::TransferIncomplete { transferred, expected }) => {
            assert_eq!(transferred, 4 * MIB);
            assert_eq!(expected, 10 * MIB);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!dst_dir.path().join("big.iso").exists());
    Ok(())
}

#[tokio::test]
async fn busy_target_refuses_a_second_offer() -> Result<()> {
    let store = StaticCredentials::default()
        .with_user("alice", "secret")
        .with_user("bob", "hunter2")
        .with_user("carol", "pw");
    let ctx = RelayContext::new(Arc::new(store), Limits::default());

    let src_dir = tempfile::tempdir()?;
    let src = src_dir.path().join("a.bin");
    write_pattern(&src, 16)?;

    let mut alice = connect(&ctx, "alice", "secret").await;
    let mut bob = connect(&ctx, "bob", "hunter2").await;
    let mut carol = connect(&ctx, "carol", "pw").await;
    alice.mark_ready().await?;
    wait_ready(&ctx, "alice").await;

    let first_src = src.clone();
    let first = tokio::spawn(async move { bob.send_file("alice", &first_src, |_| {}).await });
    let offer = alice.next_offer().await?;
    assert_eq!(offer.from_user, "bob");

    // alice still has bob's offer pending, so carol is refused without a prompt
    let err = carol.send_file("alice", &src, |_| {}).await.unwrap_err();
    assert!(matches!(err, RelayError::NegotiationFailure(_)), "{err:?}");

    alice.decline().await?;
    let err = first.await?.unwrap_err();
    assert!(matches!(err, RelayError::NegotiationFailure(Outcome::Declined)), "{err:?}");
    Ok(())
}
