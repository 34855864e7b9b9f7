//! Property tests for key encoding and issuer normalisation

mod common;

use common::{ScriptedFetcher, Step};
use cryypt_keyjar::{Key, KeyJar, KeyJarConfig, KeyKind, KeyUse};
use proptest::prelude::*;
use serde_json::Value;

fn usage() -> impl Strategy<Value = Option<KeyUse>> {
    prop_oneof![
        Just(None),
        Just(Some(KeyUse::Sig)),
        Just(Some(KeyUse::Enc)),
        Just(Some(KeyUse::Ver)),
        Just(Some(KeyUse::Dec)),
    ]
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

proptest! {
    #[test]
    fn hmac_round_trip(
        secret in proptest::collection::vec(any::<u8>(), 1..64),
        key_use in usage(),
        kid in proptest::option::of("[a-z0-9-]{1,12}"),
    ) {
        let mut key = Key::hmac(secret);
        if let Some(key_use) = key_use {
            key = key.with_use(key_use);
        }
        if let Some(kid) = &kid {
            key = key.with_kid(kid.clone());
        }

        let decoded = Key::decode(&Value::Object(key.to_serializable())).unwrap();
        prop_assert_eq!(decoded.kind(), KeyKind::Hmac);
        prop_assert_eq!(decoded.key_use(), key_use);
        prop_assert_eq!(decoded.kid(), kid.as_deref());
        prop_assert!(decoded.equals(&key));

        let mut again = decoded.clone();
        again.reconcile().unwrap();
        prop_assert_eq!(again.to_serializable(), decoded.to_serializable());
    }

    #[test]
    fn trailing_slash_equivalence(host in "[a-z]{1,10}", registered_with_slash in any::<bool>()) {
        let jar = KeyJar::with_fetcher(KeyJarConfig::default(), ScriptedFetcher::new(Vec::<Step>::new()));
        let bare = format!("https://{host}.example");
        let slashed = format!("{bare}/");
        let (registered, queried) = if registered_with_slash { (&slashed, &bare) } else { (&bare, &slashed) };

        jar.register_symmetric(registered, b"secret".to_vec(), &[KeyUse::Sig]).unwrap();
        let found = block_on(jar.verification_keys(None, queried));
        prop_assert_eq!(found.get(&KeyKind::Hmac).map(Vec::len), Some(1));
    }
}
