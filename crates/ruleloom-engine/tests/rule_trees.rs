// End-to-end tests for compiled rule trees

use ruleloom_engine::{
    Compiler, Context, CooldownLedger, Factory, Node, Platform, RequirementBody, RuleEngine,
    Scheduler, Services, TickScheduler,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::Layer;

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<String>>,
}

impl Recorder {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

impl Platform<String> for Recorder {
    fn send_message(&self, _target: &String, _message: &str) {}

    fn run_command(&self, _subject: &String, command: &str) {
        self.commands.lock().unwrap().push(command.to_string());
    }
}

struct Harness {
    engine: RuleEngine<String>,
    platform: Arc<Recorder>,
    scheduler: Arc<TickScheduler>,
}

impl Harness {
    fn new(seed: u64) -> Self {
        let platform = Arc::new(Recorder::default());
        let scheduler = Arc::new(TickScheduler::new());
        let services = Services::new(
            platform.clone(),
            scheduler.clone(),
            Arc::new(CooldownLedger::new()),
        )
        .with_seed(seed);

        Self {
            engine: RuleEngine::with_services(services),
            platform,
            scheduler,
        }
    }

    fn run(&self, yaml: &str, ctx: &Context<String>) {
        let actions = self.engine.compile_actions(&Node::from_yaml_str(yaml).unwrap());
        self.engine.trigger(ctx, &actions);
    }

    fn context(&self) -> Context<String> {
        self.engine.context("alice".to_string())
    }
}

/// Counts WARN events logged under the `rules` target
#[derive(Clone, Default)]
struct WarningCounter {
    count: Arc<AtomicUsize>,
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let meta = event.metadata();
        if *meta.level() == Level::WARN && meta.target() == "rules" {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

const PRIORITY: &str = "
- type: priority
  value:
    adult:
      conditions:
        - {type: '>=', value: ['{age}', 18]}
      actions:
        - {type: command, value: giveA}
    teen:
      conditions:
        - {type: '>=', value: ['{age}', 13]}
      actions:
        - {type: command, value: giveB}
    child:
      actions:
        - {type: command, value: giveC}
";

#[test]
fn test_priority_runs_first_matching_branch_only() {
    let harness = Harness::new(1);
    harness.run(PRIORITY, &harness.context().with_property("age", 15_i64));
    assert_eq!(harness.platform.commands(), vec!["giveB"]);
}

#[test]
fn test_priority_falls_through_to_unconditional_branch() {
    let harness = Harness::new(1);
    harness.run(PRIORITY, &harness.context().with_property("age", 5_i64));
    assert_eq!(harness.platform.commands(), vec!["giveC"]);
}

#[test]
fn test_priority_without_match_does_nothing() {
    let harness = Harness::new(1);
    harness.run(
        "
- type: priority
  value:
    only:
      conditions: [{type: '==', value: ['{rank}', gold]}]
      actions: [{type: command, value: reward}]
",
        &harness.context(),
    );
    assert!(harness.platform.commands().is_empty());
}

#[test]
fn test_chain_runs_in_order_once() {
    let harness = Harness::new(1);
    harness.run(
        "
- type: chain
  value:
    - {type: command, value: A}
    - {type: command, value: B}
    - {type: command, value: C}
",
        &harness.context(),
    );
    assert_eq!(harness.platform.commands(), vec!["A", "B", "C"]);
}

/// Register a `flag` requirement that returns its boolean value and counts
/// how often it is evaluated
fn register_flag(harness: &Harness) -> Arc<AtomicUsize> {
    let evaluated = Arc::new(AtomicUsize::new(0));
    let seen = evaluated.clone();
    harness.engine.registry().register(
        Factory::requirement(move |_: &Compiler<String>, value: &Node, _| {
            let result = value.as_bool().unwrap_or(false);
            let seen = seen.clone();
            Ok(Arc::new(move |_: &Context<String>| {
                seen.fetch_add(1, Ordering::SeqCst);
                result
            }) as Arc<dyn RequirementBody<String>>)
        }),
        &["flag"],
    );
    evaluated
}

#[test]
fn test_and_short_circuits_and_fires_failing_child() {
    let harness = Harness::new(1);
    let evaluated = register_flag(&harness);

    let node = Node::from_yaml_str(
        "
- type: '&&'
  value:
    - {type: flag, value: true, not-met-actions: [{type: command, value: first-failed}]}
    - {type: flag, value: false, not-met-actions: [{type: command, value: second-failed}]}
    - {type: flag, value: true, not-met-actions: [{type: command, value: third-failed}]}
  not-met-actions:
    - {type: command, value: and-failed}
",
    )
    .unwrap();
    let requirements = harness.engine.compile_requirements(&node, true);

    let ctx = harness.context();
    assert!(!harness.engine.is_satisfied(&ctx, &requirements, true));
    assert_eq!(evaluated.load(Ordering::SeqCst), 2);
    assert_eq!(harness.platform.commands(), vec!["second-failed", "and-failed"]);
}

#[test]
fn test_or_short_circuits_on_first_success() {
    let harness = Harness::new(1);
    let evaluated = register_flag(&harness);

    let node = Node::from_yaml_str(
        "
- type: '||'
  value:
    - {type: flag, value: false, not-met-actions: [{type: command, value: first-failed}]}
    - {type: flag, value: true}
    - {type: flag, value: true}
  not-met-actions:
    - {type: command, value: or-failed}
",
    )
    .unwrap();
    let requirements = harness.engine.compile_requirements(&node, true);

    assert!(harness.engine.is_satisfied(&harness.context(), &requirements, true));
    assert_eq!(evaluated.load(Ordering::SeqCst), 2);
    assert!(harness.platform.commands().is_empty());
}

#[test]
fn test_or_fires_own_not_met_actions_only_when_all_fail() {
    let harness = Harness::new(1);
    let evaluated = register_flag(&harness);

    let node = Node::from_yaml_str(
        "
- type: '||'
  value:
    - {type: flag, value: false, not-met-actions: [{type: command, value: child-failed}]}
    - {type: flag, value: false}
  not-met-actions:
    - {type: command, value: or-failed}
",
    )
    .unwrap();
    let ctx = harness.context();

    let requirements = harness.engine.compile_requirements(&node, true);
    assert!(!harness.engine.is_satisfied(&ctx, &requirements, false));
    assert_eq!(evaluated.load(Ordering::SeqCst), 2);
    assert!(harness.platform.commands().is_empty());

    assert!(!harness.engine.is_satisfied(&ctx, &requirements, true));
    assert_eq!(evaluated.load(Ordering::SeqCst), 4);
    assert_eq!(harness.platform.commands(), vec!["or-failed"]);
}

#[test]
fn test_and_without_side_effects_fires_nothing() {
    let harness = Harness::new(1);
    let node = Node::from_yaml_str(
        "
- type: '&&'
  value:
    - {type: '>', value: [1, 2], not-met-actions: [{type: command, value: failed}]}
",
    )
    .unwrap();
    let requirements = harness.engine.compile_requirements(&node, false);

    assert!(!harness.engine.is_satisfied(&harness.context(), &requirements, false));
    assert!(harness.platform.commands().is_empty());
}

#[test]
fn test_timer_fires_ten_times() {
    let harness = Harness::new(1);
    harness.run(
        "
- type: timer
  value:
    delay: 2
    period: 2
    duration: 20
    actions:
      - {type: command, value: pulse}
",
        &harness.context(),
    );

    harness.scheduler.advance(30);
    assert_eq!(harness.platform.commands().len(), 10);
    assert_eq!(harness.scheduler.pending(), 0);
}

#[test]
fn test_timer_async_without_runtime_runs_inline() {
    let harness = Harness::new(1);
    harness.run(
        "
- type: timer
  value: {delay: 5, period: 5, duration: 10, async: true, actions: [{type: command, value: pulse}]}
",
        &harness.context(),
    );

    // Fires at ticks 5 and 10
    harness.scheduler.advance(12);
    assert_eq!(harness.platform.commands().len(), 2);
}

#[test]
fn test_unknown_type_logs_exactly_one_warning() {
    let harness = Harness::new(1);
    let counter = WarningCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());

    let actions = tracing::subscriber::with_default(subscriber, || {
        harness
            .engine
            .compile_actions(&Node::from_yaml_str("- {type: no-such-rule, value: 1}").unwrap())
    });

    assert_eq!(counter.count.load(Ordering::SeqCst), 1);
    assert_eq!(actions.len(), 1);
    assert!(actions.iter().all(|a| a.is_noop()));

    harness.engine.trigger(&harness.context(), &actions);
    assert!(harness.platform.commands().is_empty());
}

#[test]
fn test_broken_sibling_does_not_affect_others() {
    let harness = Harness::new(1);
    harness.run(
        "
- {type: command, value: before}
- {type: delay, value: not-a-map}
- {type: command, value: after}
",
        &harness.context(),
    );
    assert_eq!(harness.platform.commands(), vec!["before", "after"]);
}

#[test]
fn test_same_tree_and_seed_behave_identically() {
    let tree = "
- {type: command, value: a, chance: 0.5}
- {type: command, value: b, chance: 0.5}
- {type: command, value: c, chance: '{luck} / 4'}
";
    let run = || {
        let harness = Harness::new(42);
        let actions = harness.engine.compile_actions(&Node::from_yaml_str(tree).unwrap());
        let ctx = harness.context().with_property("luck", 2_i64);
        for _ in 0..25 {
            harness.engine.trigger(&ctx, &actions);
        }
        harness.platform.commands()
    };

    let first = run();
    assert_eq!(first, run());
    assert!(!first.is_empty());
}

#[test]
fn test_chance_zero_never_runs_and_one_always_runs() {
    let harness = Harness::new(7);
    let ctx = harness.context();
    for _ in 0..50 {
        harness.run(
            "
- {type: command, value: never, chance: 0}
- {type: command, value: always, chance: 1}
- {type: command, value: unresolved, chance: '{missing}'}
",
            &ctx,
        );
    }
    let commands = harness.platform.commands();
    assert_eq!(commands.len(), 50);
    assert!(commands.iter().all(|c| c == "always"));
}

#[test]
fn test_failed_roll_skips_whole_chain() {
    let harness = Harness::new(3);
    let ctx = harness.context();
    for _ in 0..20 {
        harness.run(
            "
- type: chain
  chance: 0
  value:
    - {type: command, value: A}
    - {type: command, value: B}
",
            &ctx,
        );
    }
    assert!(harness.platform.commands().is_empty());
}

#[test]
fn test_failed_roll_schedules_nothing() {
    let harness = Harness::new(3);
    harness.run(
        "
- type: timer
  chance: 0
  value: {delay: 1, period: 1, duration: 5, actions: [{type: command, value: pulse}]}
- type: delay
  chance: 0
  value: {delay: 1, actions: [{type: command, value: later}]}
",
        &harness.context(),
    );

    assert_eq!(harness.scheduler.pending(), 0);
    harness.scheduler.advance(10);
    assert!(harness.platform.commands().is_empty());
}

#[test]
fn test_negating_unknown_type_logs_one_warning() {
    let harness = Harness::new(1);
    let counter = WarningCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());

    let requirements = tracing::subscriber::with_default(subscriber, || {
        harness.engine.compile_requirements(
            &Node::from_yaml_str("- {type: '!', value: {type: no-such-rule}}").unwrap(),
            true,
        )
    });

    assert_eq!(counter.count.load(Ordering::SeqCst), 1);
    assert!(requirements.iter().all(|r| r.is_noop()));
    assert!(!harness.engine.is_satisfied(&harness.context(), &requirements, true));
}

#[test]
fn test_delay_continuation_sees_later_writes() {
    let harness = Harness::new(1);
    let ctx = harness.context();
    harness.run(
        "
- type: delay
  value:
    delay: 4
    actions:
      - {type: command, value: 'reward {tier}'}
- {type: set, value: {key: tier, value: gold}}
",
        &ctx,
    );

    harness.scheduler.advance(3);
    assert!(harness.platform.commands().is_empty());
    harness.scheduler.advance(1);
    assert_eq!(harness.platform.commands(), vec!["reward gold"]);
}

#[test]
fn test_current_tick_tracks_advance() {
    let harness = Harness::new(1);
    harness.scheduler.advance(7);
    assert_eq!(harness.scheduler.current_tick(), 7);
}
