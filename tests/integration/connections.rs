use crate::*;

use tessera_peers::Direction;

/// One-sided dial: dialer holds an outbound socket, acceptor an inbound one.
#[tokio::test]
async fn test_dial_registers_both_ends() -> Result<()> {
    let (a, b) = connected_pair().await?;

    let at_a = a.wait_for_open(&b.nonce).await?;
    let at_b = b.wait_for_open(&a.nonce).await?;
    assert_eq!(at_a.direction, Some(Direction::Outbound));
    assert_eq!(at_b.direction, Some(Direction::Inbound));
    assert_eq!(at_a.port, b.port);
    assert_eq!(at_b.port, a.port, "acceptor should record the advertised port");

    assert_eq!(a.pool.peers().await?.len(), 1);
    assert_eq!(b.pool.peers().await?.len(), 1);
    Ok(())
}

/// Both nodes dial each other at once and settle on a single connection.
#[tokio::test]
async fn test_simultaneous_dial_converges() -> Result<()> {
    let a = Node::start("node-a").await?;
    let b = Node::start("node-b").await?;

    let (ra, rb) = tokio::join!(a.pool.add_peer(b.record()), b.pool.add_peer(a.record()));
    assert!(ra?);
    assert!(rb?);

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let at_a = a.pool.peer(b.nonce.clone()).await?;
        let at_b = b.pool.peer(a.nonce.clone()).await?;
        if let (Some(x), Some(y)) = (&at_a, &at_b) {
            let settled = x.state == Some(OpenState::Open)
                && y.state == Some(OpenState::Open)
                && x.direction.is_some()
                && y.direction.is_some()
                && x.direction != y.direction;
            if settled {
                break;
            }
        }
        if tokio::time::Instant::now() > deadline {
            bail!("pools never converged: a={at_a:?} b={at_b:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The surviving connection carries calls both ways.
    let status = a.pool.call(b.nonce.clone(), "status", json!({})).await?;
    assert_eq!(status["nonce"], "node-b");
    let status = b.pool.call(a.nonce.clone(), "status", json!({})).await?;
    assert_eq!(status["nonce"], "node-a");
    Ok(())
}

/// Re-offering a connected peer does not open another connection.
#[tokio::test]
async fn test_readd_keeps_existing_socket() -> Result<()> {
    let (a, b) = connected_pair().await?;
    let before = a.wait_for_open(&b.nonce).await?;

    assert!(a.pool.add_peer(b.record()).await?);
    let after = a.wait_for_open(&b.nonce).await?;
    assert_eq!(before.socket_id, after.socket_id);
    Ok(())
}

#[tokio::test]
async fn test_self_connection_refused() -> Result<()> {
    let a = Node::start("node-a").await?;
    assert!(!a.pool.add_peer(a.record()).await?);
    assert!(a.pool.peers().await?.is_empty());
    Ok(())
}

/// The acceptor answers with a different nonce than expected, so the
/// handshake fails and the entry is cleaned up.
#[tokio::test]
async fn test_wrong_nonce_entry_is_dropped() -> Result<()> {
    let a = Node::start("node-a").await?;
    let b = Node::start("node-b").await?;
    let impostor = Nonce::from("not-node-b");

    assert!(a
        .pool
        .add_peer(PeerRecord::new(impostor.clone(), "127.0.0.1", b.port))
        .await?);
    a.wait_for_absent(&impostor).await?;
    Ok(())
}

/// Removing a peer closes the connection, and the remote end forgets us.
#[tokio::test]
async fn test_remove_closes_remote_side() -> Result<()> {
    let (a, b) = connected_pair().await?;

    assert!(a.pool.remove_peer(b.nonce.clone()).await?);
    assert!(!a.pool.remove_peer(b.nonce.clone()).await?);
    assert_eq!(a.pool.peer(b.nonce.clone()).await?, None);
    b.wait_for_absent(&a.nonce).await?;
    Ok(())
}

/// A peer that goes away is dropped from the registry.
#[tokio::test]
async fn test_peer_shutdown_is_noticed() -> Result<()> {
    let (a, b) = connected_pair().await?;
    let b_nonce = b.nonce.clone();

    drop(b);
    a.wait_for_absent(&b_nonce).await?;
    Ok(())
}
