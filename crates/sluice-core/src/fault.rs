//! Fault registry — error reporting, per-component statistics, and pluggable
//! recovery.
//!
//! Every subsystem reports failures here instead of logging ad hoc. The
//! registry keeps per-component and system-wide counters, picks a default
//! recovery strategy from the (category, criticality) table, and — when a
//! component opted in — executes recovery with cooldown and escalation.
//! `system-restart` is deliberately log-only; actually restarting requires
//! an operator, not an error counter.
//!
//! One registry instance is owned by the runtime and shared by reference;
//! there are no globals. All table operations are serialized by one mutex,
//! and hooks are invoked outside it so they may report faults themselves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Every component that can report a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Codec,
    ChunkManager,
    GattTransport,
    BrokerTransport,
    Security1,
    Processor,
    ScheduleService,
    WifiService,
    SolenoidService,
}

/// What kind of failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Connection,
    Communication,
    Protocol,
    Resource,
    Memory,
    Queue,
    Processing,
    Validation,
    Timeout,
    Hardware,
    System,
    Configuration,
    Recovery,
}

/// How bad it is. Ordering matters: `Critical` and above gate the
/// system-restart mapping and the health query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
    Fatal,
}

/// What the registry may do about a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    None,
    Retry,
    ResetState,
    RestartComponent,
    RestartService,
    SystemRestart,
    Custom,
}

/// Escalation ladder. `SystemRestart` is intentionally absent — escalation
/// stops before it.
const ESCALATION_ORDER: [RecoveryStrategy; 4] = [
    RecoveryStrategy::Retry,
    RecoveryStrategy::ResetState,
    RecoveryStrategy::RestartComponent,
    RecoveryStrategy::RestartService,
];

// ── Policy and hooks ──────────────────────────────────────────────────────────

/// Per-component recovery policy, supplied at registration.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    /// Recovery stops being attempted once this many errors occur in a row.
    pub max_consecutive_errors: u32,
    /// Minimum spacing between recovery attempts.
    pub cooldown: Duration,
    /// Pause performed by the built-in `Retry` strategy.
    pub retry_delay: Duration,
    /// Master switch for automatic recovery.
    pub auto_enabled: bool,
    /// On a failed attempt, try the next strategy on the ladder.
    pub escalate_on_failure: bool,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            cooldown: Duration::from_secs(10),
            retry_delay: Duration::from_millis(100),
            auto_enabled: true,
            escalate_on_failure: false,
        }
    }
}

/// Component recovery hook: performs `ResetState`, `RestartComponent`,
/// `RestartService`, or `Custom` for its component. Returns success.
pub type RecoveryHook = Arc<dyn Fn(Component, RecoveryStrategy) -> bool + Send + Sync>;

/// Observer invoked for every reported fault.
pub type FaultHook = Arc<dyn Fn(&FaultEvent) + Send + Sync>;

/// One reported fault, as seen by the global hook.
#[derive(Debug, Clone)]
pub struct FaultEvent {
    pub component: Component,
    pub category: Category,
    pub severity: Severity,
    /// Component-specific error code.
    pub code: i32,
    /// Code from the layer underneath (driver errno, library error).
    pub underlying_code: i32,
    /// Short machine context, e.g. the function or topic involved.
    pub context: String,
    pub description: String,
}

// ── Statistics ────────────────────────────────────────────────────────────────

/// Snapshot of one component's counters.
#[derive(Debug, Clone, Default)]
pub struct ComponentStats {
    pub total_errors: u64,
    pub by_category: HashMap<Category, u64>,
    pub by_severity: HashMap<Severity, u64>,
    pub consecutive_errors: u32,
    pub last_code: Option<i32>,
}

/// Snapshot of the system-wide counters.
#[derive(Debug, Clone, Default)]
pub struct SystemStats {
    pub total_errors: u64,
    pub most_error_prone_component: Option<Component>,
}

/// What `report` did beyond bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Gate closed: auto recovery off, ceiling exceeded, cooling down, or
    /// severity too low.
    NotAttempted,
    /// A strategy ran and reported success.
    Recovered(RecoveryStrategy),
    /// Every attempted strategy failed.
    Failed,
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct ComponentRecord {
    policy: RecoveryPolicy,
    hook: Option<RecoveryHook>,
    stats: ComponentStats,
    last_recovery: Option<Instant>,
}

struct Inner {
    components: HashMap<Component, ComponentRecord>,
    total_errors: u64,
    most_error_prone: Option<Component>,
    /// (when, severity) of recent reports, pruned to the health window.
    recent: Vec<(Instant, Severity)>,
    global_hook: Option<FaultHook>,
}

/// Window the health query looks back over.
const HEALTH_WINDOW: Duration = Duration::from_secs(300);
/// Hard cap on the recent-report buffer.
const RECENT_CAP: usize = 256;

pub struct FaultRegistry {
    inner: Mutex<Inner>,
}

impl Default for FaultRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                components: HashMap::new(),
                total_errors: 0,
                most_error_prone: None,
                recent: Vec::new(),
                global_hook: None,
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a component with its policy and optional recovery hook.
    /// Re-registering replaces policy and hook but keeps the counters.
    pub fn register_component(
        &self,
        component: Component,
        policy: RecoveryPolicy,
        hook: Option<RecoveryHook>,
    ) {
        let mut inner = self.locked();
        match inner.components.get_mut(&component) {
            Some(record) => {
                record.policy = policy;
                record.hook = hook;
            }
            None => {
                inner.components.insert(
                    component,
                    ComponentRecord {
                        policy,
                        hook,
                        stats: ComponentStats::default(),
                        last_recovery: None,
                    },
                );
            }
        }
    }

    /// Install the observer invoked for every report.
    pub fn set_global_hook(&self, hook: FaultHook) {
        self.locked().global_hook = Some(hook);
    }

    /// Report a fault. Updates counters, invokes the global hook, and runs
    /// automatic recovery if the component's policy allows it.
    pub fn report(&self, event: FaultEvent) -> RecoveryOutcome {
        let strategy = default_strategy(event.category, event.severity >= Severity::Critical);

        // Phase 1 — bookkeeping and gate evaluation under the lock.
        let (global_hook, recovery) = {
            let mut inner = self.locked();
            let now = Instant::now();

            inner.total_errors += 1;
            inner.recent.push((now, event.severity));
            if inner.recent.len() > RECENT_CAP {
                inner.recent.remove(0);
            }
            let window_start = now.checked_sub(HEALTH_WINDOW);
            if let Some(start) = window_start {
                inner.recent.retain(|(at, _)| *at >= start);
            }

            let record = inner.components.entry(event.component).or_insert_with(|| {
                ComponentRecord {
                    policy: RecoveryPolicy::default(),
                    hook: None,
                    stats: ComponentStats::default(),
                    last_recovery: None,
                }
            });

            record.stats.total_errors += 1;
            *record.stats.by_category.entry(event.category).or_default() += 1;
            *record.stats.by_severity.entry(event.severity).or_default() += 1;
            record.stats.consecutive_errors += 1;
            record.stats.last_code = Some(event.code);

            let gate_open = record.policy.auto_enabled
                && record.stats.consecutive_errors <= record.policy.max_consecutive_errors
                && record
                    .last_recovery
                    .map(|at| now.duration_since(at) >= record.policy.cooldown)
                    .unwrap_or(true)
                && event.severity >= Severity::Error
                && strategy != RecoveryStrategy::None;

            let recovery = gate_open.then(|| {
                (
                    strategy,
                    record.hook.clone(),
                    record.policy.retry_delay,
                    record.policy.escalate_on_failure,
                )
            });

            // Recompute the most error-prone component.
            inner.most_error_prone = inner
                .components
                .iter()
                .max_by_key(|(_, r)| r.stats.total_errors)
                .map(|(c, _)| *c);

            (inner.global_hook.clone(), recovery)
        };

        tracing::debug!(
            component = ?event.component,
            category = ?event.category,
            severity = ?event.severity,
            code = event.code,
            context = %event.context,
            "fault reported: {}",
            event.description
        );

        if let Some(hook) = global_hook {
            hook(&event);
        }

        let Some((strategy, hook, retry_delay, escalate)) = recovery else {
            return RecoveryOutcome::NotAttempted;
        };

        // Phase 2 — run recovery outside the lock.
        let outcome = self.run_recovery(
            event.component,
            strategy,
            hook,
            retry_delay,
            escalate,
        );

        // Phase 3 — record the attempt.
        {
            let mut inner = self.locked();
            if let Some(record) = inner.components.get_mut(&event.component) {
                record.last_recovery = Some(Instant::now());
                if matches!(outcome, RecoveryOutcome::Recovered(_)) {
                    record.stats.consecutive_errors = 0;
                }
            }
        }
        outcome
    }

    fn run_recovery(
        &self,
        component: Component,
        strategy: RecoveryStrategy,
        hook: Option<RecoveryHook>,
        retry_delay: Duration,
        escalate: bool,
    ) -> RecoveryOutcome {
        let mut current = strategy;
        loop {
            let succeeded = execute_strategy(component, current, hook.as_ref(), retry_delay);
            if succeeded {
                tracing::info!(?component, strategy = ?current, "recovery succeeded");
                return RecoveryOutcome::Recovered(current);
            }

            tracing::warn!(?component, strategy = ?current, "recovery attempt failed");
            if !escalate {
                return RecoveryOutcome::Failed;
            }
            // Next rung on the ladder; never escalate into SystemRestart.
            let next = ESCALATION_ORDER
                .iter()
                .position(|s| *s == current)
                .and_then(|i| ESCALATION_ORDER.get(i + 1));
            match next {
                Some(next) => current = *next,
                None => return RecoveryOutcome::Failed,
            }
        }
    }

    /// Clear a component's consecutive-error streak (operator action or a
    /// successful external repair).
    pub fn reset_component(&self, component: Component) {
        let mut inner = self.locked();
        if let Some(record) = inner.components.get_mut(&component) {
            record.stats.consecutive_errors = 0;
        }
    }

    pub fn component_stats(&self, component: Component) -> Option<ComponentStats> {
        self.locked()
            .components
            .get(&component)
            .map(|r| r.stats.clone())
    }

    pub fn system_stats(&self) -> SystemStats {
        let inner = self.locked();
        SystemStats {
            total_errors: inner.total_errors,
            most_error_prone_component: inner.most_error_prone,
        }
    }

    /// Highest severity observed in the last five minutes, escalated to at
    /// least `Warning` when any component is past its consecutive ceiling.
    pub fn system_health(&self) -> Severity {
        let inner = self.locked();
        let now = Instant::now();
        let mut health = inner
            .recent
            .iter()
            .filter(|(at, _)| now.duration_since(*at) < HEALTH_WINDOW)
            .map(|(_, severity)| *severity)
            .max()
            .unwrap_or(Severity::Info);

        let over_ceiling = inner.components.values().any(|r| {
            r.stats.consecutive_errors > r.policy.max_consecutive_errors
        });
        if over_ceiling && health < Severity::Warning {
            health = Severity::Warning;
        }
        health
    }
}

/// The default-strategy table keyed on category and criticality.
fn default_strategy(category: Category, critical: bool) -> RecoveryStrategy {
    use Category::*;
    match category {
        Connection | Communication | Timeout => RecoveryStrategy::Retry,
        Memory | Resource | Queue => {
            if critical {
                RecoveryStrategy::ResetState
            } else {
                RecoveryStrategy::Retry
            }
        }
        Protocol | Validation => RecoveryStrategy::ResetState,
        Configuration => RecoveryStrategy::None,
        Hardware | System => {
            if critical {
                RecoveryStrategy::SystemRestart
            } else {
                RecoveryStrategy::Retry
            }
        }
        Processing => {
            if critical {
                RecoveryStrategy::ResetState
            } else {
                RecoveryStrategy::Retry
            }
        }
        // Faults about recovery itself never trigger more recovery.
        Recovery => RecoveryStrategy::None,
    }
}

fn execute_strategy(
    component: Component,
    strategy: RecoveryStrategy,
    hook: Option<&RecoveryHook>,
    retry_delay: Duration,
) -> bool {
    match strategy {
        RecoveryStrategy::None => false,
        RecoveryStrategy::Retry => {
            if !retry_delay.is_zero() {
                std::thread::sleep(retry_delay);
            }
            true
        }
        RecoveryStrategy::ResetState
        | RecoveryStrategy::RestartComponent
        | RecoveryStrategy::RestartService
        | RecoveryStrategy::Custom => match hook {
            Some(hook) => hook(component, strategy),
            None => false,
        },
        RecoveryStrategy::SystemRestart => {
            // Log-only on purpose. A real restart needs an explicit opt-in
            // path, not an error counter.
            tracing::error!(?component, "system-restart requested — logging only");
            true
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
