use crate::*;

use tessera_peers::PoolHandleError;

#[tokio::test]
async fn test_call_round_trip() -> Result<()> {
    let (a, b) = connected_pair().await?;

    let reply = a
        .pool
        .call(b.nonce.clone(), "echo", json!({ "height": 12 }))
        .await?;
    assert_eq!(reply, json!({ "height": 12 }));

    // Inbound sockets are upgraded too.
    let reply = b.pool.call(a.nonce.clone(), "status", json!({})).await?;
    assert_eq!(reply["nonce"], "node-a");
    Ok(())
}

#[tokio::test]
async fn test_event_reaches_peer_handler() -> Result<()> {
    let (a, b) = connected_pair().await?;

    a.pool
        .emit(b.nonce.clone(), "postBlock", json!({ "id": "b1", "height": 3 }))
        .await?;
    let block = b.next_block().await?;
    assert_eq!(block["id"], "b1");
    Ok(())
}

#[tokio::test]
async fn test_unknown_procedure_rejected_locally() -> Result<()> {
    let (a, b) = connected_pair().await?;

    let err = a
        .pool
        .call(b.nonce.clone(), "nope", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolHandleError::Rpc(_)), "got {err:?}");
    Ok(())
}

#[tokio::test]
async fn test_call_to_unknown_peer() -> Result<()> {
    let a = Node::start("node-a").await?;

    let err = a
        .pool
        .call(Nonce::from("ghost"), "status", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolHandleError::NotConnected(_)));
    Ok(())
}
