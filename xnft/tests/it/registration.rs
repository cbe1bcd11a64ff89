use xnft::{registry, token::Collection};

use crate::Network;

#[xnft_macros::test]
async fn registration_is_idempotent(network: Network) {
    network.setup().await;
    let Network {
        quartz,
        karura,
        alice,
        ..
    } = &network;

    for (reserve, other) in [(quartz, karura), (karura, quartz)] {
        let collection = Collection::create(reserve, alice).await.unwrap();
        let asset_id = collection.asset_id().unwrap();
        assert_eq!(registry::derivative_collection(other, &asset_id).await.unwrap(), None);

        let first = registry::register_foreign_asset(other, alice, &asset_id, "xNFT")
            .await
            .unwrap();
        let second = registry::register_foreign_asset(other, alice, &asset_id, "xNFT")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(
            registry::derivative_collection(other, &asset_id).await.unwrap(),
            Some(first)
        );
    }
}

#[xnft_macros::test]
async fn currencies_are_registered_once(network: Network) {
    network.setup().await;
    // A second setup finds everything in place.
    network.setup().await;

    let Network { quartz, karura, .. } = &network;
    assert!(
        registry::derivative_collection(quartz, &karura.native_currency().id)
            .await
            .unwrap()
            .is_some()
    );
}
