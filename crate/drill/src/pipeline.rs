//! The per-slot crypto operation pipeline and the outer iteration loop.
//!
//! Each slot runs an ordered step sequence with per-step failure
//! isolation: a failing step is journaled as FAIL and aborts the remaining
//! steps for that slot's current iteration only. The session is closed and
//! the next slot proceeds regardless.

use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};

use tokendrill_token::{
    ObjectClass, ObjectHandle, SearchTemplate, SlotManager, TkError, TkResult, TokenProvider,
};

use crate::{
    identity::{CplcSource, NoCplc, resolve_identity},
    journal::{Journal, OperationRecord, Outcome},
};

/// Number of random bytes drawn per iteration.
const RANDOM_LENGTH: usize = 128;

/// Runtime configuration of one load-test run.
pub struct Config {
    pub pin: String,
    pub key_id: Vec<u8>,
    pub max_iterations: u64,
    pub interval: Duration,
    pub journal_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Login,
    FindPrivateKey,
    FindPublicKey,
    Random,
    Encrypt,
    Digest,
    Sign,
    Verify,
    Decrypt,
    Logout,
}

impl Step {
    const fn name(self) -> &'static str {
        match self {
            Step::Login => "LOGIN",
            Step::FindPrivateKey => "FIND_KEY_PRIVATE",
            Step::FindPublicKey => "FIND_KEY_PUBLIC",
            Step::Random => "RANDOM",
            Step::Encrypt => "ENCRYPT",
            Step::Digest => "DIGEST",
            Step::Sign => "SIGN",
            Step::Verify => "VERIFY",
            Step::Decrypt => "DECRYPT",
            Step::Logout => "LOGOUT",
        }
    }

    const fn label(self) -> &'static str {
        match self {
            Step::Login => "Login",
            Step::FindPrivateKey => "Find Private key",
            Step::FindPublicKey => "Find Public key",
            Step::Random => "Generate Random Data",
            Step::Encrypt => "Encrypt",
            Step::Digest => "Digest",
            Step::Sign => "Sign",
            Step::Verify => "Verify Signature",
            Step::Decrypt => "Decrypt",
            Step::Logout => "Logout",
        }
    }
}

/// Explicit driver context: provider handle, configuration, journal and the
/// cancellation flag set by the signal handler.
pub struct Pipeline {
    provider: Arc<dyn TokenProvider>,
    config: Config,
    journal: Journal,
    cancel: Arc<AtomicBool>,
    cplc: Box<dyn CplcSource>,
}

impl Pipeline {
    #[must_use]
    pub fn new(provider: Arc<dyn TokenProvider>, config: Config, cancel: Arc<AtomicBool>) -> Self {
        let journal = Journal::new(config.journal_dir.clone());
        Pipeline {
            provider,
            config,
            journal,
            cancel,
            cplc: Box::new(NoCplc),
        }
    }

    /// Replace the alternate identity source.
    #[must_use]
    pub fn with_cplc_source(mut self, cplc: Box<dyn CplcSource>) -> Self {
        self.cplc = cplc;
        self
    }

    /// Discover slots and resolve one durable identity per slot.
    ///
    /// Every failure here is fatal to the run: no slots with a token, or a
    /// slot whose identity cannot be resolved.
    pub fn startup(&self) -> TkResult<Vec<(SlotManager, String)>> {
        let slots = self.provider.slots(true)?;
        if slots.is_empty() {
            return Err(TkError::Default(
                "you must have at least one slot available with a token present".to_string(),
            ));
        }

        let mut prepared = Vec::with_capacity(slots.len());
        for slot in slots {
            let mut manager = SlotManager::new(self.provider.clone(), slot);
            let token = manager.token_info()?;
            info!(
                "FOUND SLOT ID = {}, DESCRIPTION = '{}', TOKEN = '{}'",
                manager.slot().id,
                manager.slot().description,
                token.label
            );

            manager.open_session(false)?;
            let identity = match resolve_identity(&manager, &self.config.key_id, self.cplc.as_ref())
            {
                Ok(identity) => identity,
                Err(e) => {
                    error!(
                        "unable to retrieve a serial number for slot {}: {e}",
                        manager.slot().id
                    );
                    manager.close_session()?;
                    return Err(e);
                }
            };
            manager.close_session()?;
            prepared.push((manager, identity));
        }
        Ok(prepared)
    }

    /// Run the iteration loop over the prepared slots.
    ///
    /// Cancellation is observed only between iterations; an in-flight slot
    /// pipeline always runs to completion or per-step failure first.
    pub fn run(&self, slots: &mut [(SlotManager, String)]) {
        let max = self.config.max_iterations;
        let mut iteration = 0;
        while iteration < max {
            iteration += 1;
            info!("ITERATION {iteration} of {max}:");
            for (manager, identity) in slots.iter_mut() {
                self.process_slot(manager, identity, iteration);
            }

            if self.cancel.load(Ordering::Relaxed) {
                info!("skipping further load test iterations");
                break;
            }
            if iteration < max {
                info!(
                    "iteration complete, waiting for {}ms",
                    self.config.interval.as_millis()
                );
                thread::sleep(self.config.interval);
            }
        }
        info!("LOAD TEST COMPLETE");
    }

    fn process_slot(&self, manager: &mut SlotManager, identity: &str, iteration: u64) {
        info!("SERIAL: {identity}");
        if let Err(e) = manager.open_session(false) {
            error!(
                "unable to open a session on slot {}: {e}",
                manager.slot().id
            );
            return;
        }
        let mut run = SlotRun {
            pipeline: self,
            manager: &mut *manager,
            identity,
            iteration,
        };
        run.steps();
        if let Err(e) = manager.close_session() {
            warn!("unable to close the session on slot {}: {e}", manager.slot().id);
        }
    }
}

struct SlotRun<'a> {
    pipeline: &'a Pipeline,
    manager: &'a mut SlotManager,
    identity: &'a str,
    iteration: u64,
}

impl SlotRun<'_> {
    /// The ordered step sequence. `None` means a step failed and the rest
    /// of this slot's iteration was abandoned.
    fn steps(&mut self) -> Option<()> {
        let pin = self.pipeline.config.pin.clone();
        let key_id = self.pipeline.config.key_id.clone();

        self.step(Step::Login, |manager| {
            manager.login(&pin).map(|()| ((), None))
        })?;

        let private_key = self.step(Step::FindPrivateKey, |manager| {
            find_key(manager, ObjectClass::PrivateKey, &key_id, "private key")
                .map(|handle| (handle, None))
        })?;
        let public_key = self.step(Step::FindPublicKey, |manager| {
            find_key(manager, ObjectClass::PublicKey, &key_id, "public key")
                .map(|handle| (handle, None))
        })?;

        let random = self.step(Step::Random, |manager| {
            manager
                .generate_random(RANDOM_LENGTH)
                .map(|data| (data.clone(), Some(data)))
        })?;
        let ciphertext = self.step(Step::Encrypt, |manager| {
            manager
                .encrypt(public_key, &random)
                .map(|data| (data.clone(), Some(data)))
        })?;
        let digest = self.step(Step::Digest, |manager| {
            manager.digest(&ciphertext).map(|data| (data, None))
        })?;
        let signature = self.step(Step::Sign, |manager| {
            manager
                .sign(private_key, &digest)
                .map(|data| (data.clone(), Some(data)))
        })?;

        // A mismatch is not a provider error, but it is not a successful
        // step either: journal FAIL and abandon the iteration.
        match self.manager.verify(public_key, &digest, &signature) {
            Ok(true) => {
                info!(" - {} ... Success", Step::Verify.label());
                self.journal(Step::Verify, Outcome::Success, None);
            }
            Ok(false) => {
                warn!(" - {} ... Mismatch", Step::Verify.label());
                self.journal(Step::Verify, Outcome::Fail, None);
                return None;
            }
            Err(e) => {
                info!(" - {} ... Failed: {e}", Step::Verify.label());
                self.journal(Step::Verify, Outcome::Fail, None);
                return None;
            }
        }

        self.step(Step::Decrypt, |manager| {
            manager
                .decrypt(private_key, &ciphertext)
                .map(|data| (data.clone(), Some(data)))
        })?;
        self.step(Step::Logout, |manager| {
            manager.logout().map(|()| ((), None))
        })?;
        Some(())
    }

    fn step<T>(
        &mut self,
        step: Step,
        run: impl FnOnce(&mut SlotManager) -> TkResult<(T, Option<Vec<u8>>)>,
    ) -> Option<T> {
        match run(self.manager) {
            Ok((value, payload)) => {
                info!(" - {} ... Success", step.label());
                self.journal(step, Outcome::Success, payload.as_deref());
                Some(value)
            }
            Err(e) => {
                info!(" - {} ... Failed: {e}", step.label());
                self.journal(step, Outcome::Fail, None);
                None
            }
        }
    }

    fn journal(&self, step: Step, outcome: Outcome, payload: Option<&[u8]>) {
        let record = OperationRecord {
            identity: self.identity,
            iteration: self.iteration,
            operation: step.name(),
            outcome,
            payload,
        };
        if let Err(e) = self.pipeline.journal.append(&record) {
            error!("unable to append to the journal for {}: {e}", self.identity);
        } else {
            debug!("journaled {} {}", step.name(), outcome.as_str());
        }
    }
}

fn find_key(
    manager: &SlotManager,
    class: ObjectClass,
    key_id: &[u8],
    what: &'static str,
) -> TkResult<ObjectHandle> {
    let template = SearchTemplate::with_class(class).and_id(key_id);
    let handles = manager.find_objects(&template)?;
    handles.first().copied().ok_or(TkError::NotFound(what))
}
