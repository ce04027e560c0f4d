//! Construction-time validation of the public `Client`/`ClientConfig`
//! surface: configuration errors are reported as an error from `new`,
//! never deferred to first use.

use flmesh::{Client, ClientConfig, Credential, LifecycleState};

#[test]
fn rejects_empty_workspace_id() {
    let config = ClientConfig::new("", Credential::Static("token".to_string()));
    assert!(Client::new(config).is_err());
}

#[test]
fn rejects_empty_static_credential() {
    let config = ClientConfig::new("workspace-1", Credential::Static(String::new()));
    assert!(Client::new(config).is_err());
}

#[test]
fn accepts_a_provider_credential_without_invoking_it() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let called = Arc::new(AtomicBool::new(false));
    let called_in_provider = Arc::clone(&called);
    let provider: flmesh::TokenProvider = Arc::new(move || {
        called_in_provider.store(true, Ordering::SeqCst);
        Box::pin(async { Ok("token".to_string()) })
    });

    let config = ClientConfig::new("workspace-1", Credential::Provider(provider));
    let (client, _driver) = Client::new(config).expect("provider credential should construct");
    assert_eq!(client.lifecycle_state(), LifecycleState::Idle);
    assert!(!called.load(Ordering::SeqCst));
}

#[test]
fn fresh_client_has_no_peers_and_is_idle() {
    let config = ClientConfig::new("workspace-1", Credential::Static("token".to_string()));
    let (client, _driver) = Client::new(config).unwrap();
    assert!(client.get_peers().is_empty());
    assert_eq!(client.lifecycle_state(), LifecycleState::Idle);
    assert!(!client.can_send());
}
