use xnft::{event::EventKind, scan};

use crate::Network;

#[xnft_macros::test]
async fn parachains_start_with_the_first_session(network: Network) {
    assert_eq!(network.relay.session_index().await.unwrap(), 0);
    network.relay.wait_for_parachains_start().await.unwrap();
    assert!(network.relay.session_index().await.unwrap() > 0);

    let sessions = scan::wait_for_events(network.relay.ledger(), EventKind::NewSession, 12)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
}

#[xnft_macros::test]
async fn waits_give_up_after_max_blocks(network: Network) {
    network.setup().await;
    let quartz_height = network.fake.backend("Quartz").unwrap().height();

    let error = scan::wait_for_events(&network.quartz, EventKind::ItemCreated, 3)
        .await
        .unwrap_err();
    assert!(error.is_timeout(), "{error}");
    assert!(network.fake.backend("Quartz").unwrap().height() >= quartz_height + 3);
    assert_eq!(network.fake.open_subscriptions(), 0);
}
