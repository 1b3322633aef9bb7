//! Fingerprint → session map: creation, delta computation, per-session
//! prompt serialization, idle GC, reset-on-corruption, heartbeat.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kirogate_shared::message::{Message, Role};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::session::{AgentSession, KillOutcome, SessionEvents, SpawnOptions, SpawnOrHandshakeError};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub agent_bin: PathBuf,
    pub subcommand: String,
    pub default_extra_args: Vec<String>,
    pub default_cwd: PathBuf,
    pub prompt_timeout: Duration,
    pub idle_timeout: Duration,
    pub context_warn_pct: f64,
    pub context_critical_pct: f64,
    pub context_reset_pct: f64,
    pub consecutive_error_limit: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            agent_bin: PathBuf::from("kiro"),
            subcommand: "agent".to_string(),
            default_extra_args: Vec::new(),
            default_cwd: PathBuf::from("."),
            prompt_timeout: Duration::from_secs(5 * 60),
            idle_timeout: Duration::from_secs(30 * 60),
            context_warn_pct: 80.0,
            context_critical_pct: 90.0,
            context_reset_pct: 95.0,
            consecutive_error_limit: 3,
        }
    }
}

/// Per-session overrides resolved by the channel router before a session is
/// created.
#[derive(Debug, Clone, Default)]
pub struct SessionOverride {
    pub cwd: Option<PathBuf>,
    pub extra_args: Option<Vec<String>>,
}

struct ManagedSession {
    session: Arc<AgentSession>,
    send_count: usize,
    prompt_lock: Arc<Mutex<()>>,
    last_touched: Instant,
    consecutive_errors: u32,
}

struct SharedState {
    last_touched: std::sync::Mutex<Instant>,
    last_context_pct: std::sync::Mutex<Option<f64>>,
    pending_reset: std::sync::Mutex<bool>,
}

struct PoolEvents {
    key: String,
    shared: Arc<SharedState>,
    reset_trigger_pct: f64,
}

impl SessionEvents for PoolEvents {
    fn on_activity(&self) {
        *self.shared.last_touched.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn on_context_usage(&self, pct: f64) {
        *self.shared.last_context_pct.lock().unwrap_or_else(|e| e.into_inner()) = Some(pct);
        if pct >= self.reset_trigger_pct {
            *self.shared.pending_reset.lock().unwrap_or_else(|e| e.into_inner()) = true;
            info!(key = %self.key, pct, "context usage crossed reset threshold, flagging for reset");
        }
    }
}

pub struct Diagnostics {
    pub key: String,
    pub context_pct: Option<f64>,
    pub idle_secs: u64,
    pub rss_kb: Option<u64>,
    pub consecutive_errors: u32,
    pub prompting: bool,
    pub agent_session_id: String,
    pub pid: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Spawn(#[from] SpawnOrHandshakeError),
}

/// `(session, delta text to prompt with, an owned guard on the session's
/// prompt lock)`. The guard is acquired *before* the delta is computed and
/// held by the caller for the entire turn; dropping it (end of scope, or
/// explicitly in a `finally`-style block) is what lets the next turn for
/// this key proceed. This is the "awaitable that releases automatically"
/// design: nobody ever needs to remember to unlock it.
pub struct Lease {
    pub session: Arc<AgentSession>,
    pub delta_text: String,
    pub prompt_guard: tokio::sync::OwnedMutexGuard<()>,
}

pub struct SessionPool {
    options: PoolOptions,
    entries: RwLock<HashMap<String, ManagedSession>>,
    shared_states: RwLock<HashMap<String, Arc<SharedState>>>,
}

impl SessionPool {
    pub fn new(options: PoolOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            entries: RwLock::new(HashMap::new()),
            shared_states: RwLock::new(HashMap::new()),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Look up the managed session for `key`, reaping it first if its
    /// subprocess has died, and fall through to spawning a fresh one.
    pub async fn get_or_create(
        self: &Arc<Self>,
        key: &str,
        messages: &[Message],
        session_override: SessionOverride,
    ) -> Result<Lease, PoolError> {
        // Step 1/2: reuse or reap an existing entry.
        {
            let entries = self.entries.read().await;
            if let Some(managed) = entries.get(key) {
                if managed.session.is_alive() {
                    let prompt_lock = managed.prompt_lock.clone();
                    let session = managed.session.clone();
                    drop(entries);

                    // Await (and take ownership of) the previous turn's lock
                    // before reading send_count: this is both the
                    // serialization point and the lock this turn will hold
                    // for its own duration.
                    let guard = prompt_lock.lock_owned().await;

                    let mut entries = self.entries.write().await;
                    let Some(managed) = entries.get_mut(key) else {
                        // Evicted by a GC sweep while we awaited the lock.
                        drop(guard);
                        drop(entries);
                        return self.create(key, messages, session_override).await;
                    };

                    if messages.len() < managed.send_count {
                        // Upstream reset: caller's array shrank. Drop our
                        // guard before evicting — reap() kills the session.
                        drop(guard);
                        drop(entries);
                        self.reset(key, "upstream-reset").await;
                    } else {
                        let delta = &messages[managed.send_count.min(messages.len())..];
                        let delta_text = render_messages(delta);
                        managed.send_count = messages.len();
                        managed.last_touched = Instant::now();
                        return Ok(Lease {
                            session,
                            delta_text,
                            prompt_guard: guard,
                        });
                    }
                } else {
                    drop(entries);
                    self.reap(key).await;
                }
            }
        }

        self.create(key, messages, session_override).await
    }

    async fn create(
        self: &Arc<Self>,
        key: &str,
        messages: &[Message],
        session_override: SessionOverride,
    ) -> Result<Lease, PoolError> {

        // Step 3: resolve per-session spawn options, honoring the router
        // override.
        let cwd = session_override
            .cwd
            .unwrap_or_else(|| self.options.default_cwd.clone());
        let extra_args = session_override
            .extra_args
            .unwrap_or_else(|| self.options.default_extra_args.clone());

        let shared = Arc::new(SharedState {
            last_touched: std::sync::Mutex::new(Instant::now()),
            last_context_pct: std::sync::Mutex::new(None),
            pending_reset: std::sync::Mutex::new(false),
        });
        let events: Arc<dyn SessionEvents> = Arc::new(PoolEvents {
            key: key.to_string(),
            shared: shared.clone(),
            reset_trigger_pct: self.options.context_reset_pct,
        });

        let spawn_options = SpawnOptions {
            agent_bin: self.options.agent_bin.clone(),
            subcommand: self.options.subcommand.clone(),
            extra_args,
            cwd,
            prompt_timeout: self.options.prompt_timeout,
        };

        // Step 4: create a fresh session, a pre-resolved prompt lock, and
        // immediately take ownership of it for this turn.
        let session = Arc::new(AgentSession::create(spawn_options, events).await?);
        let delta_text = render_messages(messages);
        let prompt_lock = Arc::new(Mutex::new(()));
        let guard = prompt_lock
            .clone()
            .try_lock_owned()
            .unwrap_or_else(|_| panic!("a freshly created prompt lock is never contended"));

        self.shared_states
            .write()
            .await
            .insert(key.to_string(), shared);
        self.entries.write().await.insert(
            key.to_string(),
            ManagedSession {
                session: session.clone(),
                send_count: messages.len(),
                prompt_lock,
                last_touched: Instant::now(),
                consecutive_errors: 0,
            },
        );

        Ok(Lease {
            session,
            delta_text,
            prompt_guard: guard,
        })
    }

    pub async fn record_prompt_outcome(&self, key: &str, succeeded: bool) {
        if let Some(managed) = self.entries.write().await.get_mut(key) {
            if succeeded {
                managed.consecutive_errors = 0;
            } else {
                managed.consecutive_errors += 1;
            }
        }
    }

    pub async fn consecutive_errors(&self, key: &str) -> u32 {
        self.entries
            .read()
            .await
            .get(key)
            .map(|m| m.consecutive_errors)
            .unwrap_or(0)
    }

    pub async fn context_pct(&self, key: &str) -> Option<f64> {
        let shared = self.shared_states.read().await.get(key)?.clone();
        *shared.last_context_pct.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn context_reset_pending(&self, key: &str) -> bool {
        match self.shared_states.read().await.get(key) {
            Some(shared) => *shared.pending_reset.lock().unwrap_or_else(|e| e.into_inner()),
            None => false,
        }
    }

    /// Kill and evict. The next `get_or_create` for `key` spawns fresh.
    pub async fn reset(&self, key: &str, reason: &str) {
        info!(key, reason, "resetting session");
        self.reap(key).await;
    }

    async fn reap(&self, key: &str) {
        let removed = self.entries.write().await.remove(key);
        self.shared_states.write().await.remove(key);
        if let Some(managed) = removed {
            let outcome: KillOutcome = managed.session.kill().await;
            info!(
                key,
                pid = managed.session.pid(),
                forced = outcome.killed_forcefully,
                code = ?outcome.code,
                signal = ?outcome.signal,
                "agent subprocess reaped"
            );
        }
    }

    /// A periodic sweep evicting idle-and-not-in-flight sessions and dead
    /// subprocesses. Never kills an entry whose prompt lock is held.
    pub async fn run_idle_gc(self: Arc<Self>) {
        let interval = Duration::from_secs((self.options.idle_timeout.as_secs() / 6).max(60));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.sweep_idle().await;
        }
    }

    /// The sweep body `run_idle_gc` drives on a timer; exposed directly so
    /// tests can trigger a sweep deterministically instead of waiting out
    /// the real interval.
    pub async fn sweep_idle(&self) {
        let dead_or_idle: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter_map(|(key, managed)| {
                    if !managed.session.is_alive() {
                        return Some(key.clone());
                    }
                    let idle = managed.last_touched.elapsed() >= self.options.idle_timeout;
                    if idle && managed.prompt_lock.try_lock().is_ok() {
                        Some(key.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for key in dead_or_idle {
            self.reap(&key).await;
        }
    }

    /// An unref'd 5-minute timer logging a structured summary of every live
    /// entry, for passive diagnostics.
    pub async fn run_heartbeat(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        loop {
            ticker.tick().await;
            for diag in self.diagnostics().await {
                let key_prefix: String = diag.key.chars().take(8).collect();
                info!(
                    key_prefix = %key_prefix,
                    context_pct = diag.context_pct,
                    idle_secs = diag.idle_secs,
                    rss_kb = diag.rss_kb,
                    consecutive_errors = diag.consecutive_errors,
                    prompting = diag.prompting,
                    "session heartbeat"
                );
            }
        }
    }

    pub async fn diagnostics(&self) -> Vec<Diagnostics> {
        let entries = self.entries.read().await;
        let shared_states = self.shared_states.read().await;
        let mut out: Vec<Diagnostics> = entries
            .iter()
            .map(|(key, managed)| {
                let context_pct = shared_states.get(key).and_then(|shared| {
                    *shared
                        .last_context_pct
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                });
                Diagnostics {
                    key: key.clone(),
                    context_pct,
                    idle_secs: managed.last_touched.elapsed().as_secs(),
                    rss_kb: managed.session.rss_kb(),
                    consecutive_errors: managed.consecutive_errors,
                    prompting: managed.prompt_lock.try_lock().is_err(),
                    agent_session_id: managed.session.agent_session_id.clone(),
                    pid: managed.session.pid(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Stop timers (the caller drops the spawned GC/heartbeat tasks), kill
    /// every subprocess, clear the map.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.entries.read().await.keys().cloned().collect();
        for key in keys {
            self.reap(&key).await;
        }
    }
}

/// Concatenate `user` message text, blank-line joined, trimmed. System
/// (and unknown-role) messages are dropped.
pub fn render_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.is_role(Role::User))
        .map(|m| m.text())
        .collect::<Vec<_>>()
        .join("\n\n")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kirogate_shared::message::Content;

    fn msg(role: Role, text: &str) -> Message {
        Message {
            role,
            content: Content::Text(text.to_string()),
        }
    }

    #[test]
    fn render_messages_drops_system_and_assistant_keeps_only_user_text() {
        let rendered = render_messages(&[
            msg(Role::System, "you are an assistant"),
            msg(Role::User, "hello"),
            msg(Role::Assistant, "hi there"),
            msg(Role::User, "more"),
        ]);
        assert_eq!(rendered, "hello\n\nmore");
    }

    #[test]
    fn render_messages_trims_and_handles_empty_input() {
        assert_eq!(render_messages(&[]), "");
        assert_eq!(render_messages(&[msg(Role::User, "  solo  ")]), "solo");
    }

    #[tokio::test]
    async fn diagnostics_is_empty_for_a_fresh_pool() {
        let pool = SessionPool::new(PoolOptions::default());
        assert!(pool.diagnostics().await.is_empty());
    }
}
