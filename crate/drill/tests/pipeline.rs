//! End-to-end pipeline runs against the in-memory software token.

use std::{
    fs,
    path::Path,
    sync::{Arc, atomic::AtomicBool},
    time::Duration,
};

use tempfile::TempDir;

use tokendrill::{
    identity::CplcSource,
    pipeline::{Config, Pipeline},
};
use tokendrill_soft::SoftToken;

const PIN: &str = "1234";
const STEP_ORDER: [&str; 10] = [
    "LOGIN",
    "FIND_KEY_PRIVATE",
    "FIND_KEY_PUBLIC",
    "RANDOM",
    "ENCRYPT",
    "DIGEST",
    "SIGN",
    "VERIFY",
    "DECRYPT",
    "LOGOUT",
];

fn config(dir: &Path, pin: &str, key_id: Vec<u8>, iterations: u64) -> Config {
    Config {
        pin: pin.to_string(),
        key_id,
        max_iterations: iterations,
        interval: Duration::from_millis(0),
        journal_dir: dir.to_path_buf(),
    }
}

fn journal_lines(dir: &Path, identity: &str) -> Vec<String> {
    let contents = fs::read_to_string(dir.join(format!("{identity}.log")))
        .unwrap_or_else(|e| panic!("journal for {identity} should exist: {e}"));
    contents.lines().map(str::to_string).collect()
}

struct Fields {
    identity: String,
    iteration: u64,
    operation: String,
    outcome: String,
    payload: Option<String>,
}

fn parse_line(line: &str) -> Fields {
    let fields: Vec<&str> = line.split(',').collect();
    assert!(
        fields.len() == 5 || fields.len() == 6,
        "unexpected journal line: {line}"
    );
    Fields {
        identity: fields[1].to_string(),
        iteration: fields[2].parse().expect("iteration number"),
        operation: fields[3].to_string(),
        outcome: fields[4].to_string(),
        payload: fields.get(5).map(|payload| (*payload).to_string()),
    }
}

#[test]
fn fault_free_iterations_journal_every_step_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", PIN);
    token.add_certificate(slot, Some(&[0x01]), &[0xAA, 0xBB, 0xCC], "identity");
    token
        .add_rsa_keypair(slot, &[0x01], "test keys")
        .expect("keypair");

    let pipeline = Pipeline::new(
        token.clone(),
        config(dir.path(), PIN, vec![0x01], 3),
        Arc::new(AtomicBool::new(false)),
    );
    let mut slots = pipeline.startup().expect("startup");
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].1, "AABBCC");
    pipeline.run(&mut slots);

    let lines = journal_lines(dir.path(), "AABBCC");
    assert_eq!(lines.len(), 30);
    for (index, line) in lines.iter().enumerate() {
        let fields = parse_line(line);
        assert_eq!(fields.identity, "AABBCC");
        assert_eq!(fields.iteration, index as u64 / 10 + 1);
        assert_eq!(fields.operation, STEP_ORDER[index % 10]);
        assert_eq!(fields.outcome, "SUCCESS");
    }

    // No session is left behind once the run completes.
    assert_eq!(token.open_session_count(), 0);
}

#[test]
fn data_steps_carry_payloads_and_decrypt_round_trips() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", PIN);
    token.add_certificate(slot, Some(&[0x01]), &[0x01], "identity");
    token
        .add_rsa_keypair(slot, &[0x01], "test keys")
        .expect("keypair");

    let pipeline = Pipeline::new(
        token,
        config(dir.path(), PIN, vec![0x01], 1),
        Arc::new(AtomicBool::new(false)),
    );
    let mut slots = pipeline.startup().expect("startup");
    pipeline.run(&mut slots);

    let lines = journal_lines(dir.path(), "01");
    let records: Vec<Fields> = lines.iter().map(|line| parse_line(line)).collect();

    let payload_of = |operation: &str| {
        records
            .iter()
            .find(|record| record.operation == operation)
            .unwrap_or_else(|| panic!("{operation} should be journaled"))
            .payload
            .clone()
    };

    let random = payload_of("RANDOM").expect("RANDOM carries a payload");
    assert_eq!(random.len(), 256);
    assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(random.to_uppercase(), random);

    let ciphertext = payload_of("ENCRYPT").expect("ENCRYPT carries a payload");
    assert_eq!(ciphertext.len(), 512);
    assert!(payload_of("SIGN").is_some());

    // The decrypted plaintext is the generated random block.
    assert_eq!(payload_of("DECRYPT").as_deref(), Some(random.as_str()));

    // Control steps carry no payload.
    for operation in ["LOGIN", "FIND_KEY_PRIVATE", "FIND_KEY_PUBLIC", "DIGEST", "VERIFY", "LOGOUT"]
    {
        assert!(payload_of(operation).is_none(), "{operation} has no payload");
    }
}

#[test]
fn wrong_pin_journals_one_fail_and_closes_the_session() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", "9876");
    token.add_certificate(slot, Some(&[0x01]), &[0x0D], "identity");
    token
        .add_rsa_keypair(slot, &[0x01], "test keys")
        .expect("keypair");

    let pipeline = Pipeline::new(
        token.clone(),
        config(dir.path(), PIN, vec![0x01], 1),
        Arc::new(AtomicBool::new(false)),
    );
    let mut slots = pipeline.startup().expect("startup");
    pipeline.run(&mut slots);

    let lines = journal_lines(dir.path(), "0D");
    assert_eq!(lines.len(), 1);
    let fields = parse_line(&lines[0]);
    assert_eq!(fields.operation, "LOGIN");
    assert_eq!(fields.outcome, "FAIL");
    assert!(fields.payload.is_none());
    assert_eq!(token.open_session_count(), 0);
}

#[test]
fn unmatched_key_id_falls_back_to_the_first_certificate() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", PIN);
    // The only certificate carries a different key identifier.
    token.add_certificate(slot, Some(&[0x02]), &[0xBE, 0xEF], "identity");
    token
        .add_rsa_keypair(slot, &[0x01], "test keys")
        .expect("keypair");

    let pipeline = Pipeline::new(
        token,
        config(dir.path(), PIN, vec![0x01], 1),
        Arc::new(AtomicBool::new(false)),
    );
    let mut slots = pipeline.startup().expect("startup");
    assert_eq!(slots[0].1, "BEEF");
    pipeline.run(&mut slots);

    let lines = journal_lines(dir.path(), "BEEF");
    assert_eq!(lines.len(), 10);
    assert!(lines.iter().all(|line| parse_line(line).outcome == "SUCCESS"));
}

#[test]
fn a_failing_slot_does_not_stop_the_others() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());

    // Slot A has no private key, so its iteration dies after the find step.
    let broken = token.add_slot("Broken reader", "BROKEN", PIN);
    token.add_certificate(broken, Some(&[0x01]), &[0x0A], "identity a");

    let healthy = token.add_slot("Healthy reader", "HEALTHY", PIN);
    token.add_certificate(healthy, Some(&[0x01]), &[0x0B], "identity b");
    token
        .add_rsa_keypair(healthy, &[0x01], "test keys")
        .expect("keypair");

    let pipeline = Pipeline::new(
        token.clone(),
        config(dir.path(), PIN, vec![0x01], 1),
        Arc::new(AtomicBool::new(false)),
    );
    let mut slots = pipeline.startup().expect("startup");
    assert_eq!(slots.len(), 2);
    pipeline.run(&mut slots);

    let broken_lines = journal_lines(dir.path(), "0A");
    assert_eq!(broken_lines.len(), 2);
    assert_eq!(parse_line(&broken_lines[0]).operation, "LOGIN");
    assert_eq!(parse_line(&broken_lines[0]).outcome, "SUCCESS");
    assert_eq!(parse_line(&broken_lines[1]).operation, "FIND_KEY_PRIVATE");
    assert_eq!(parse_line(&broken_lines[1]).outcome, "FAIL");

    let healthy_lines = journal_lines(dir.path(), "0B");
    assert_eq!(healthy_lines.len(), 10);
    assert!(
        healthy_lines
            .iter()
            .all(|line| parse_line(line).outcome == "SUCCESS")
    );
    assert_eq!(token.open_session_count(), 0);
}

#[test]
fn startup_fails_without_a_token_bearing_slot() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    token.add_empty_slot("Empty reader");

    let pipeline = Pipeline::new(
        token,
        config(dir.path(), PIN, vec![0x01], 1),
        Arc::new(AtomicBool::new(false)),
    );
    assert!(pipeline.startup().is_err());
}

#[test]
fn startup_fails_when_no_certificate_exists() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", PIN);
    token
        .add_rsa_keypair(slot, &[0x01], "test keys")
        .expect("keypair");

    let pipeline = Pipeline::new(
        token.clone(),
        config(dir.path(), PIN, vec![0x01], 1),
        Arc::new(AtomicBool::new(false)),
    );
    assert!(pipeline.startup().is_err());
    assert_eq!(token.open_session_count(), 0);
}

#[test]
fn cancellation_is_observed_between_iterations() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", PIN);
    token.add_certificate(slot, Some(&[0x01]), &[0xC4], "identity");
    token
        .add_rsa_keypair(slot, &[0x01], "test keys")
        .expect("keypair");

    // The flag is already set: the first iteration still runs to
    // completion, no second one starts.
    let cancel = Arc::new(AtomicBool::new(true));
    let pipeline = Pipeline::new(token, config(dir.path(), PIN, vec![0x01], 100), cancel);
    let mut slots = pipeline.startup().expect("startup");
    pipeline.run(&mut slots);

    let lines = journal_lines(dir.path(), "C4");
    assert_eq!(lines.len(), 10);
    assert!(lines.iter().all(|line| parse_line(line).outcome == "SUCCESS"));
}

struct FixedCplc(Vec<u8>);

impl CplcSource for FixedCplc {
    fn query_cplc(&self, _slot_description: &str) -> Option<Vec<u8>> {
        Some(self.0.clone())
    }
}

#[test]
fn cplc_serial_takes_precedence_over_the_certificate_serial() {
    let dir = TempDir::new().expect("tempdir");
    let token = Arc::new(SoftToken::new());
    let slot = token.add_slot("Soft reader 0", "SOFT TOKEN", PIN);
    token.add_certificate(slot, Some(&[0x01]), &[0xAA], "identity");
    token
        .add_rsa_keypair(slot, &[0x01], "test keys")
        .expect("keypair");

    let mut response = vec![0_u8; 42];
    response[12..16].copy_from_slice(&[0xCA, 0xFE, 0x00, 0x42]);
    response.extend_from_slice(&[0x90, 0x00]);

    let pipeline = Pipeline::new(
        token,
        config(dir.path(), PIN, vec![0x01], 1),
        Arc::new(AtomicBool::new(false)),
    )
    .with_cplc_source(Box::new(FixedCplc(response)));

    let mut slots = pipeline.startup().expect("startup");
    assert_eq!(slots[0].1, "CAFE0042");
    pipeline.run(&mut slots);
    assert_eq!(journal_lines(dir.path(), "CAFE0042").len(), 10);
}
