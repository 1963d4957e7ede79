use keyseat_license::{
    CredentialResolver, CredentialSource, ENV_API_TOKEN, ENV_API_TOKEN_FILE, EnvSnapshot,
    FileStore, LocalStore, MemoryStore,
};
use serial_test::serial;
use std::path::PathBuf;

fn env_with(token: Option<&str>) -> EnvSnapshot {
    EnvSnapshot {
        api_token: token.map(str::to_string),
        api_token_file: None,
    }
}

#[test]
fn precedence_steps_down_one_source_at_a_time() {
    let store = MemoryStore::new();
    store.write_token("from-file").unwrap();
    let env = env_with(Some("from-env"));

    let all = CredentialResolver::new(Some("from-flag"), &env, &store, Some("from-config"));
    let cred = all.resolve().unwrap();
    assert_eq!((cred.token(), cred.source()), ("from-flag", CredentialSource::Flag));

    let no_flag = CredentialResolver::new(None, &env, &store, Some("from-config"));
    let cred = no_flag.resolve().unwrap();
    assert_eq!((cred.token(), cred.source()), ("from-env", CredentialSource::Env));

    let empty_env = env_with(None);
    let no_env = CredentialResolver::new(None, &empty_env, &store, Some("from-config"));
    let cred = no_env.resolve().unwrap();
    assert_eq!((cred.token(), cred.source()), ("from-file", CredentialSource::File));

    store.clear_token().unwrap();
    let no_file = CredentialResolver::new(None, &empty_env, &store, Some("from-config"));
    let cred = no_file.resolve().unwrap();
    assert_eq!((cred.token(), cred.source()), ("from-config", CredentialSource::Config));

    let nothing = CredentialResolver::new(None, &empty_env, &store, None);
    assert!(nothing.resolve().is_none());
}

#[test]
fn blank_sources_fall_through() {
    let store = MemoryStore::new();
    store.write_token("   ").unwrap();
    let env = env_with(Some(""));
    let resolver = CredentialResolver::new(Some(" "), &env, &store, Some("cfg"));
    let cred = resolver.resolve().unwrap();
    assert_eq!(cred.source(), CredentialSource::Config);
}

#[test]
fn resolution_is_repeatable() {
    let store = MemoryStore::new();
    let env = env_with(Some("tok"));
    let resolver = CredentialResolver::new(None, &env, &store, None);
    assert_eq!(resolver.resolve(), resolver.resolve());
}

#[test]
fn token_file_is_read_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let token_file = dir.path().join("api_token");
    std::fs::write(&token_file, "file-token\n").unwrap();
    let store = FileStore::new(&token_file, dir.path());

    let env = env_with(None);
    let cred = CredentialResolver::new(None, &env, &store, None)
        .resolve()
        .unwrap();
    assert_eq!(cred.token(), "file-token");
    assert_eq!(cred.source(), CredentialSource::File);
}

#[test]
fn unreadable_token_file_falls_through_to_config() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the token file should be cannot be read as one.
    let token_path = dir.path().join("api_token");
    std::fs::create_dir(&token_path).unwrap();
    let store = FileStore::new(&token_path, dir.path());
    assert!(store.read_token().is_err());

    let env = env_with(None);
    let cred = CredentialResolver::new(None, &env, &store, Some("config-token"))
        .resolve()
        .unwrap();
    assert_eq!(cred.token(), "config-token");
    assert_eq!(cred.source(), CredentialSource::Config);

    assert!(CredentialResolver::new(None, &env, &store, None).resolve().is_none());
}

#[test]
#[serial]
fn env_snapshot_captures_process_environment() {
    // SAFETY: serialized with every other test touching these variables.
    unsafe {
        std::env::set_var(ENV_API_TOKEN, "env-token");
        std::env::set_var(ENV_API_TOKEN_FILE, "/tmp/keyseat-token");
    }
    let snapshot = EnvSnapshot::capture();
    unsafe {
        std::env::remove_var(ENV_API_TOKEN);
        std::env::remove_var(ENV_API_TOKEN_FILE);
    }

    assert_eq!(snapshot.api_token.as_deref(), Some("env-token"));
    assert_eq!(snapshot.api_token_file, Some(PathBuf::from("/tmp/keyseat-token")));

    // Later changes to the environment do not leak into the snapshot.
    assert_eq!(EnvSnapshot::capture(), EnvSnapshot::default());
}

#[test]
#[serial]
fn empty_token_file_variable_is_ignored() {
    unsafe {
        std::env::set_var(ENV_API_TOKEN_FILE, "");
    }
    let snapshot = EnvSnapshot::capture();
    unsafe {
        std::env::remove_var(ENV_API_TOKEN_FILE);
    }
    assert_eq!(snapshot.api_token_file, None);
}
