use xnft::{
    error::{DeliveryFailure, Error},
    registry::{self, DerivativeStatus},
    sovereign::{Relationship, sovereign_account},
    token::Collection,
    transfer::{self, Transfer, TransferState},
};

use crate::{KARURA, Network, QUARTZ};

#[xnft_macros::test]
async fn round_trip_from_a_foreign_assets_ledger(network: Network) {
    network.setup().await;
    let Network {
        quartz,
        karura,
        alice,
        bob,
        ..
    } = &network;
    let token = network.mint(quartz, alice).await;

    let fee = quartz.native_currency().as_multiasset(1).unwrap();
    let derivative = transfer::transfer(quartz, alice, &token, fee, karura, bob.account())
        .await
        .unwrap();
    assert_eq!(derivative.ledger.name(), "Karura");
    assert!(derivative.check_owner(bob.account()).await.unwrap());
    // Both ledgers derive the custodian independently.
    let custodian = quartz.sovereign_account_of(karura).unwrap();
    assert_eq!(custodian, sovereign_account(Relationship::Sibling, KARURA));
    assert!(token.check_owner(custodian).await.unwrap());

    let fee = karura.native_currency().as_multiasset(1).unwrap();
    let returned = transfer::transfer(karura, bob, &token, fee, quartz, alice.account())
        .await
        .unwrap();
    assert_eq!(returned.to_string(), token.to_string());
    assert!(token.check_owner(alice.account()).await.unwrap());
    let status = registry::derivative_status(karura, derivative.collection_id, token.asset_instance())
        .await
        .unwrap();
    assert_eq!(status, DerivativeStatus::Stashed(derivative.token_id));

    // Exporting the token again brings the stashed derivative back into circulation.
    let fee = quartz.native_currency().as_multiasset(1).unwrap();
    let again = transfer::transfer(quartz, alice, &token, fee, karura, alice.account())
        .await
        .unwrap();
    assert_eq!(again.to_string(), derivative.to_string());
    assert!(again.check_owner(alice.account()).await.unwrap());
}

#[xnft_macros::test]
async fn round_trip_from_an_xnft_ledger(network: Network) {
    network.setup().await;
    let Network {
        quartz,
        karura,
        alice,
        bob,
        ..
    } = &network;
    let token = network.mint(karura, bob).await;

    let fee = karura.native_currency().as_multiasset(1).unwrap();
    let derivative = transfer::transfer(karura, bob, &token, fee, quartz, alice.account())
        .await
        .unwrap();
    assert!(derivative.check_owner(alice.account()).await.unwrap());
    assert!(
        token
            .check_owner(sovereign_account(Relationship::Sibling, QUARTZ))
            .await
            .unwrap()
    );

    let fee = quartz.native_currency().as_multiasset(1).unwrap();
    transfer::transfer(quartz, alice, &token, fee, karura, bob.account())
        .await
        .unwrap();
    assert!(token.check_owner(bob.account()).await.unwrap());
    // The derivative is burned, not stashed.
    assert_eq!(derivative.owner().await.unwrap(), None);
    let error = registry::derivative_of(quartz, &token).await.unwrap_err();
    assert!(matches!(error, Error::NoDerivativeToken { .. }), "{error}");
}

#[xnft_macros::test]
async fn derivatives_move_with_native_transfers(network: Network) {
    network.setup().await;
    let Network {
        quartz,
        karura,
        alice,
        bob,
        ..
    } = &network;
    let token = network.mint(quartz, alice).await;

    let fee = quartz.native_currency().as_multiasset(1).unwrap();
    let derivative = transfer::transfer(quartz, alice, &token, fee, karura, bob.account())
        .await
        .unwrap();
    derivative.transfer(bob, alice.account()).await.unwrap();
    assert!(derivative.check_owner(alice.account()).await.unwrap());

    // Bob no longer holds the derivative, so he cannot send the token home.
    let fee = karura.native_currency().as_multiasset(1).unwrap();
    let error = transfer::transfer(karura, bob, &token, fee.clone(), quartz, bob.account())
        .await
        .unwrap_err();
    assert!(error.is_module_error("xTokens", "XcmExecutionFailed"), "{error}");

    transfer::transfer(karura, alice, &token, fee, quartz, alice.account())
        .await
        .unwrap();
    assert!(token.check_owner(alice.account()).await.unwrap());
}

#[xnft_macros::test]
async fn derivatives_cannot_pose_as_native_tokens(network: Network) {
    network.setup().await;
    let Network {
        quartz,
        karura,
        alice,
        bob,
        ..
    } = &network;
    let token = network.mint(quartz, alice).await;
    let fee = quartz.native_currency().as_multiasset(1).unwrap();
    let derivative = transfer::transfer(quartz, alice, &token, fee, karura, bob.account())
        .await
        .unwrap();

    // Karura is not the reserve of its derivative, so it must not send it as though it were.
    let fee = karura.native_currency().as_multiasset(1).unwrap();
    let mut spoofed = Transfer::new(karura, &derivative, fee, quartz, bob.account());
    let error = spoofed.submit(bob).await.unwrap_err();
    assert!(error.is_module_error("xTokens", "XcmExecutionFailed"), "{error}");
    assert_eq!(spoofed.state(), TransferState::DeliveryRejected);
    assert!(derivative.check_owner(bob.account()).await.unwrap());
}

#[xnft_macros::test]
async fn unregistered_assets_are_rejected_by_the_destination(network: Network) {
    network.setup().await;
    let Network {
        quartz,
        karura,
        alice,
        bob,
        ..
    } = &network;
    let collection = Collection::create(quartz, alice).await.unwrap();
    let token = collection.mint(alice, alice.account()).await.unwrap();

    let fee = quartz.native_currency().as_multiasset(1).unwrap();
    let mut transfer = Transfer::new(quartz, &token, fee, karura, bob.account());
    let hash = transfer.submit(alice).await.unwrap();
    assert_eq!(transfer.state(), TransferState::MessageSent);
    assert_eq!(transfer.message_hash(), Some(hash));

    let error = transfer.await_delivery().await.unwrap_err();
    let Error::BridgeDeliveryFailed {
        message_hash,
        reason,
        ..
    } = &error
    else {
        panic!("expected a delivery failure, got {error}");
    };
    assert_eq!(*message_hash, hash);
    assert_eq!(*reason, DeliveryFailure::Rejected("AssetNotFound".to_owned()));
    assert_eq!(transfer.state(), TransferState::DeliveryRejected);
    assert!(transfer.state().is_terminal());
}
