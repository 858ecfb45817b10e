//! Integration tests for the process-wide auth state
//!
//! The state is global, so the whole lifecycle runs in a single test.

use docchat::auth::{self, AuthSession, CredentialStore};

fn temp_store(name: &str) -> CredentialStore {
    let path = std::env::temp_dir()
        .join(format!("docchat-auth-it-{}", std::process::id()))
        .join(name);
    let _ = std::fs::remove_file(&path);
    CredentialStore::new(path)
}

#[test]
fn test_auth_lifecycle_persists_and_clears() {
    let store = temp_store("session.json");
    assert_eq!(auth::init(store.clone()), None);
    assert_eq!(auth::current(), None);
    assert_eq!(auth::token(), None);

    let session = AuthSession {
        email: "reader@example.com".into(),
        token: "tok-1".into(),
    };
    auth::set(session.clone());
    assert_eq!(auth::current(), Some(session.clone()));
    assert_eq!(auth::token().as_deref(), Some("tok-1"));
    assert!(store.path().exists());

    // A fresh start restores the saved credential
    assert_eq!(auth::init(store.clone()), Some(session));

    auth::clear();
    assert_eq!(auth::current(), None);
    assert!(!store.path().exists());
    assert_eq!(auth::init(store.clone()), None);

    // Corrupt files are ignored rather than treated as signed in
    std::fs::write(store.path(), "not json").unwrap();
    assert_eq!(auth::init(store.clone()), None);
    auth::clear();
    assert!(!store.path().exists());

    let _ = std::fs::remove_dir_all(store.path().parent().unwrap());
}
