use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle;
use tracing::{info, warn};

use ruleloom_config::{ExpansionConfig, RuleloomConfig};
use ruleloom_engine::{
    CooldownLedger, InstallReport, RuleBook, RuleEngine, Services, TickScheduler,
};
use ruleloom_host::{
    create_engine, create_host_from_config, setup_reload_signal, ExpansionHost,
    WasmExpansionSource,
};

use crate::console::{ConsolePlatform, ConsoleSubject, Output};
use crate::vars::property_value;

/// An engine wired to the console.
///
/// Without a runtime, `async` continuations run inline on the ticking
/// thread; `run` relies on that to report their output deterministically.
pub struct Session {
    pub engine: RuleEngine<ConsoleSubject>,
    pub scheduler: Arc<TickScheduler>,
    pub platform: Arc<ConsolePlatform>,
    pub host: ExpansionHost<ConsoleSubject>,
}

impl Session {
    pub fn new(
        config: &RuleloomConfig,
        expansions: &ExpansionConfig,
        platform: ConsolePlatform,
        seed: Option<u64>,
        runtime: Option<Handle>,
    ) -> Result<Self> {
        let platform = Arc::new(platform);
        let scheduler = Arc::new(match runtime {
            Some(runtime) => TickScheduler::with_runtime(runtime),
            None => TickScheduler::new(),
        });

        let mut services = Services::new(
            platform.clone(),
            scheduler.clone(),
            Arc::new(CooldownLedger::new()),
        );
        if let Some(seed) = seed {
            services = services.with_seed(seed);
        }
        let engine = RuleEngine::with_services(services);

        let host = create_host_from_config(engine.registry().clone(), expansions)
            .context("Failed to set up expansions")?;

        info!(
            "Engine ready: {} rule types, tick every {:?}",
            engine.registry().len(),
            config.scheduler.tick_interval()
        );

        Ok(Self {
            engine,
            scheduler,
            platform,
            host,
        })
    }

    pub fn load_rules(&self, path: &Path) -> Result<RuleBook<ConsoleSubject>> {
        self.engine
            .load_rule_book_file(path)
            .with_context(|| format!("Failed to load rules from {}", path.display()))
    }
}

/// Expansion settings with the command line directory applied
pub fn expansion_settings(
    config: &RuleloomConfig,
    dir: Option<&Path>,
    hot_reload: bool,
) -> ExpansionConfig {
    let mut expansions = config.expansions.clone();
    if let Some(dir) = dir {
        expansions.enabled = true;
        expansions.dir = Some(dir.to_path_buf());
    }
    expansions.hot_reload = expansions.hot_reload && hot_reload;
    expansions
}

/// Shape of one compiled event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSummary {
    pub name: String,
    pub conditions: usize,
    pub actions: usize,
    /// Top-level rules that failed to compile
    pub disabled: usize,
}

pub fn summarize(book: &RuleBook<ConsoleSubject>) -> Vec<EventSummary> {
    book.events()
        .filter_map(|name| {
            let rules = book.get(name)?;
            let disabled = rules.conditions.iter().filter(|r| r.is_noop()).count()
                + rules.actions.iter().filter(|a| a.is_noop()).count();
            Some(EventSummary {
                name: name.to_string(),
                conditions: rules.conditions.len(),
                actions: rules.actions.len(),
                disabled,
            })
        })
        .collect()
}

/// Compile a rule file and describe every event in it
pub fn check(
    config: &RuleloomConfig,
    rules: &Path,
    expansions: Option<&Path>,
) -> Result<Vec<EventSummary>> {
    let settings = expansion_settings(config, expansions, false);
    let session = Session::new(config, &settings, ConsolePlatform::new(), None, None)?;
    let book = session.load_rules(rules)?;
    Ok(summarize(&book))
}

pub struct RunOptions {
    pub rules: PathBuf,
    pub event: String,
    pub subject: String,
    pub vars: Vec<(String, String)>,
    pub placeholders: Vec<(String, String)>,
    pub ticks: u64,
    pub expansions: Option<PathBuf>,
    pub seed: Option<u64>,
    pub quiet: bool,
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Whether the event's conditions held
    pub fired: bool,
    pub output: Vec<Output>,
    /// Scheduled work still pending after the last tick
    pub pending: usize,
}

/// Fire one event for a console subject, then advance the scheduler
pub fn run(config: &RuleloomConfig, options: RunOptions) -> Result<RunOutcome> {
    let mut platform = ConsolePlatform::new().with_placeholders(options.placeholders);
    if options.quiet {
        platform = platform.quiet();
    }

    let settings = expansion_settings(config, options.expansions.as_deref(), false);
    let session = Session::new(config, &settings, platform, options.seed, None)?;
    let book = session.load_rules(&options.rules)?;

    if book.get(&options.event).is_none() {
        let known: Vec<_> = book.events().collect();
        warn!(
            "Event '{}' is not in {} (known: {})",
            options.event,
            options.rules.display(),
            known.join(", ")
        );
    }

    let ctx = session.engine.context(ConsoleSubject::new(options.subject));
    for (key, value) in &options.vars {
        ctx.set(key.clone(), property_value(value));
    }

    let fired = book.fire(&options.event, &ctx);
    session.scheduler.advance(options.ticks);

    Ok(RunOutcome {
        fired,
        output: session.platform.transcript(),
        pending: session.scheduler.pending(),
    })
}

/// Install every artifact in `dir` into a fresh registry
pub fn list_expansions(
    config: &RuleloomConfig,
    dir: Option<&Path>,
) -> Result<InstallReport<ConsoleSubject>> {
    let settings = expansion_settings(config, dir, false);
    let engine = RuleEngine::<ConsoleSubject>::new(
        Arc::new(ConsolePlatform::new().quiet()),
        Arc::new(TickScheduler::new()),
    );
    let source = WasmExpansionSource::new(create_engine()?, settings.fuel_per_call)?;
    let mut host = ExpansionHost::new(engine.registry().clone(), source, settings.dir());
    Ok(host.reload())
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Keep a rule file compiled and expansions installed until Ctrl-C.
///
/// The rule book is recompiled when the file changes; expansions are
/// reinstalled when their directory changes or on SIGUSR2.
pub async fn watch(
    config: &RuleloomConfig,
    rules: &Path,
    expansions: Option<&Path>,
) -> Result<()> {
    let settings = expansion_settings(config, expansions, true);
    let mut session = Session::new(
        config,
        &settings,
        ConsolePlatform::new(),
        None,
        Some(Handle::current()),
    )?;

    let mut book = session.load_rules(rules)?;
    report_book(&book);
    let mut rules_modified = modified(rules);

    let driver = session
        .scheduler
        .clone()
        .drive(config.scheduler.tick_interval());
    let mut reload_rx = setup_reload_signal();
    let mut signals_open = true;
    let mut ticker = tokio::time::interval(
        session
            .host
            .hot_reload_interval()
            .unwrap_or(ruleloom_host::DEFAULT_SCAN_INTERVAL),
    );
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Watching {} (Ctrl-C to stop)", rules.display());

    loop {
        let mut rules_changed = false;

        tokio::select! {
            _ = &mut shutdown => break,
            changed = reload_rx.changed(), if signals_open => {
                if changed.is_err() {
                    signals_open = false;
                    continue;
                }
                session.host.reload();
                rules_changed = true;
            }
            _ = ticker.tick() => {
                if session.host.poll().is_some() {
                    rules_changed = true;
                }
                let now = modified(rules);
                if now != rules_modified {
                    rules_modified = now;
                    rules_changed = true;
                }
            }
        }

        if rules_changed {
            match session.load_rules(rules) {
                Ok(reloaded) => {
                    book = reloaded;
                    report_book(&book);
                }
                Err(e) => warn!("{:#}; keeping the previous rules", e),
            }
        }
    }

    driver.abort();
    info!("Stopped watching {}", rules.display());
    Ok(())
}

fn report_book(book: &RuleBook<ConsoleSubject>) {
    for event in summarize(book) {
        info!(
            "{}: {} condition(s), {} action(s){}",
            event.name,
            event.conditions,
            event.actions,
            if event.disabled > 0 {
                format!(", {} disabled", event.disabled)
            } else {
                String::new()
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ruleloom_engine::{ActionBody, Context, Factory, Node};
    use std::fs;
    use std::sync::Mutex;

    const RULES: &str = "
join:
  conditions:
    - {type: '>=', value: ['{age}', 18]}
  actions:
    - {type: message, value: 'Welcome %player_name%'}
    - type: delay
      value:
        delay: 5
        actions:
          - {type: command, value: 'give {player} bread'}
    - {type: no-such-rule}
leave:
  actions:
    - {type: command, value: bye}
";

    fn offline_config(dir: &Path) -> RuleloomConfig {
        let mut config = RuleloomConfig::default();
        config.expansions.dir = Some(dir.join("expansions"));
        config
    }

    fn options(rules: PathBuf, event: &str, ticks: u64) -> RunOptions {
        RunOptions {
            rules,
            event: event.to_string(),
            subject: "Alice".to_string(),
            vars: vec![
                ("age".to_string(), "21".to_string()),
                ("player".to_string(), "alice".to_string()),
            ],
            placeholders: Vec::new(),
            ticks,
            expansions: None,
            seed: Some(1),
            quiet: true,
        }
    }

    #[test]
    fn test_check_summarizes_events() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.yml");
        fs::write(&rules, RULES).unwrap();

        let summary = check(&offline_config(dir.path()), &rules, None).unwrap();
        assert_eq!(
            summary,
            vec![
                EventSummary {
                    name: "join".to_string(),
                    conditions: 1,
                    actions: 3,
                    disabled: 1,
                },
                EventSummary {
                    name: "leave".to_string(),
                    conditions: 0,
                    actions: 1,
                    disabled: 0,
                },
            ]
        );
    }

    #[test]
    fn test_check_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = check(&offline_config(dir.path()), &dir.path().join("nope.yml"), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_run_fires_event_and_advances_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.yml");
        fs::write(&rules, RULES).unwrap();

        let outcome = run(&offline_config(dir.path()), options(rules, "join", 5)).unwrap();
        assert!(outcome.fired);
        assert_eq!(outcome.pending, 0);
        assert_eq!(
            outcome.output,
            vec![
                Output::Message {
                    target: "Alice".to_string(),
                    text: "Welcome Alice".to_string()
                },
                Output::Command {
                    subject: "Alice".to_string(),
                    command: "give alice bread".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_run_leaves_delayed_work_pending() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.yml");
        fs::write(&rules, RULES).unwrap();

        let outcome = run(&offline_config(dir.path()), options(rules, "join", 2)).unwrap();
        assert!(outcome.fired);
        assert_eq!(outcome.output.len(), 1);
        assert_eq!(outcome.pending, 1);
    }

    #[test]
    fn test_run_unmet_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules.yml");
        fs::write(&rules, RULES).unwrap();

        let mut opts = options(rules, "join", 10);
        opts.vars = vec![("age".to_string(), "12".to_string())];

        let outcome = run(&offline_config(dir.path()), opts).unwrap();
        assert!(!outcome.fired);
        assert!(outcome.output.is_empty());
    }

    #[test]
    fn test_expansion_settings_dir_override_enables() {
        let mut config = RuleloomConfig::default();
        config.expansions.enabled = false;

        let settings = expansion_settings(&config, Some(Path::new("/srv/exp")), false);
        assert!(settings.enabled);
        assert!(!settings.hot_reload);
        assert_eq!(settings.dir(), PathBuf::from("/srv/exp"));
    }

    #[test]
    fn test_list_expansions_of_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let report = list_expansions(&RuleloomConfig::default(), Some(dir.path())).unwrap();
        assert!(report.installed.is_empty());
        assert!(report.failed.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_delay_runs_off_the_ticking_thread() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());
        let settings = expansion_settings(&config, None, false);
        let session = Session::new(
            &config,
            &settings,
            ConsolePlatform::new().quiet(),
            None,
            Some(Handle::current()),
        )
        .unwrap();

        let ran_on = Arc::new(Mutex::new(None));
        let seen = ran_on.clone();
        session.engine.registry().register(
            Factory::action(move |_, _| {
                let seen = seen.clone();
                Ok(Arc::new(move |_: &Context<ConsoleSubject>| {
                    *seen.lock().unwrap() = Some(std::thread::current().id());
                }) as Arc<dyn ActionBody<ConsoleSubject>>)
            }),
            &["record-thread"],
        );

        let actions = session.engine.compile_actions(
            &Node::from_yaml_str(
                "- {type: delay, value: {delay: 1, async: true, actions: [{type: record-thread}]}}",
            )
            .unwrap(),
        );
        let ctx = session.engine.context(ConsoleSubject::new("Alice"));
        session.engine.trigger(&ctx, &actions);
        session.scheduler.tick();

        let mut thread = None;
        for _ in 0..200 {
            thread = *ran_on.lock().unwrap();
            if thread.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let thread = thread.expect("async continuation never ran");
        assert_ne!(thread, std::thread::current().id());
    }
}
