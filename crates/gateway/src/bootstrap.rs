//! `AppState` construction and background-task spawning, shared by every
//! entry point that needs the full runtime: `serve`, `run`, `chat`.
//!
//! Keeping this in one place means the orchestration core (state store,
//! action store, event bus + projections, scheduler) is wired up
//! identically no matter which CLI command booted it.

use std::sync::Arc;

use anyhow::Context;
use sha2::{Digest, Sha256};

use sa_domain::config::{Config, ConfigSeverity};
use sa_mcp_client::McpManager;
use sa_memory::create_provider as create_memory_provider;
use sa_providers::registry::ProviderRegistry;
use sa_sessions::{ConversationStateStore, IdentityResolver, LifecycleManager, SessionStore, TranscriptWriter};
use sa_skills::registry::SkillsRegistry;
use sa_tools::ProcessManager;

use crate::nodes::registry::NodeRegistry;
use crate::nodes::router::ToolRouter;
use crate::state::AppState;
use crate::workspace::bootstrap::BootstrapTracker;
use crate::workspace::files::WorkspaceReader;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`]. This is the shared "boot" path used by `serve`, `run` and
/// `chat`.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Workspace reader ─────────────────────────────────────────────
    let workspace = Arc::new(WorkspaceReader::new(config.workspace.path.clone()));
    tracing::info!(path = %config.workspace.path.display(), "workspace reader ready");

    // ── Bootstrap tracker ────────────────────────────────────────────
    let bootstrap = Arc::new(
        BootstrapTracker::new(config.workspace.state_path.clone())
            .context("initializing bootstrap tracker")?,
    );

    // ── Skills ───────────────────────────────────────────────────────
    let skills = Arc::new(SkillsRegistry::load(&config.skills.path).context("loading skills")?);
    tracing::info!(skills_count = skills.list().len(), "skills loaded");

    // ── SerialMemory client ──────────────────────────────────────────
    let memory: Arc<dyn sa_memory::SerialMemoryProvider> =
        create_memory_provider(&config.serial_memory).context("creating SerialMemory client")?;
    tracing::info!(
        url = %config.serial_memory.base_url,
        transport = ?config.serial_memory.transport,
        "SerialMemory client ready"
    );

    // ── LLM providers ────────────────────────────────────────────────
    let llm =
        Arc::new(ProviderRegistry::from_config(&config.llm).context("initializing LLM providers")?);
    if llm.is_empty() {
        tracing::warn!(
            "no LLM providers initialized — gateway will run but \
             /v1/models will be empty and LLM calls will fail"
        );
    } else {
        tracing::info!(providers = llm.len(), "LLM provider registry ready");
    }

    // ── Smart router (embedding-based model tier classification) ─────
    let smart_router = match config.llm.router.as_ref() {
        Some(rc) => sa_providers::smart_router::SmartRouter::from_config(rc)
            .await
            .map(Arc::new),
        None => None,
    };
    tracing::info!(enabled = smart_router.is_some(), "smart router ready");

    // ── Session management ───────────────────────────────────────────
    let sessions =
        Arc::new(SessionStore::new(&config.workspace.state_path).context("initializing session store")?);
    let identity = Arc::new(IdentityResolver::from_config(&config.sessions.identity_links));
    let lifecycle = Arc::new(LifecycleManager::new(config.sessions.lifecycle.clone()));
    let transcript_dir = sessions.transcript_dir();
    let transcripts = Arc::new(TranscriptWriter::new(&transcript_dir));
    tracing::info!(
        agent_id = %config.sessions.agent_id,
        dm_scope = ?config.sessions.dm_scope,
        identity_links = identity.len(),
        "session management ready"
    );

    // ── Process manager (exec/process tools) ───────────────────────
    let processes = Arc::new(ProcessManager::new(config.tools.exec.clone()));
    tracing::info!("process manager ready");

    // ── Node registry + tool router ──────────────────────────────────
    let nodes = Arc::new(NodeRegistry::new());
    nodes.load_allowlists_from_env();
    let tool_router = Arc::new(ToolRouter::new(nodes.clone(), config.tools.exec.timeout_sec));
    tracing::info!("node registry + tool router ready");

    // ── Session locks (per-session concurrency) ──────────────────────
    let session_locks = Arc::new(crate::runtime::session_lock::SessionLockMap::new());
    tracing::info!("session lock map ready");

    // ── Cancel map (per-session cancellation) ─────────────────────────
    let cancel_map = Arc::new(crate::runtime::cancel::CancelMap::new());
    tracing::info!("cancel map ready");

    // ── Dedupe store (inbound idempotency, 24h TTL) ────────────────
    let dedupe = Arc::new(crate::api::inbound::DedupeStore::new(
        std::time::Duration::from_secs(86_400),
    ));
    tracing::info!("dedupe store ready (24h TTL)");

    // ── Quota tracker (per-agent daily token/cost usage) ─────────────
    let quota_tracker = Arc::new(crate::runtime::quota::QuotaTracker::new(config.quota.clone()));
    tracing::info!("quota tracker ready");

    // ── Run store ────────────────────────────────────────────────────
    let run_store = Arc::new(crate::runtime::runs::RunStore::new(&config.workspace.state_path));
    tracing::info!("run store ready");

    // ── Task store + runner ─────────────────────────────────────────
    let task_config = config.tasks.clamped();
    let task_store = Arc::new(crate::runtime::tasks::TaskStore::new());
    let task_runner = Arc::new(crate::runtime::tasks::TaskRunner::new(task_config.max_concurrent));
    tracing::info!(
        max_concurrent = task_config.max_concurrent,
        "task store + runner ready"
    );

    // ── Skill engine (callable skills: web.fetch, etc.) ─────────────
    let skill_engine =
        Arc::new(crate::skills::build_default_engine().context("initializing skill engine")?);
    tracing::info!(skills = skill_engine.len(), "skill engine ready");

    // ── Schedule store ───────────────────────────────────────────────
    let schedule_store = Arc::new(crate::runtime::schedules::ScheduleStore::new(
        &config.workspace.state_path,
    ));
    tracing::info!("schedule store ready");

    // ── Delivery store ──────────────────────────────────────────────
    let delivery_store = Arc::new(crate::runtime::deliveries::DeliveryStore::new(
        &config.workspace.state_path,
    ));
    tracing::info!("delivery store ready");

    // ── Orchestration core: State Store, Action Store, Event Bus ────
    let conversation_store = Arc::new(
        ConversationStateStore::new(&config.workspace.state_path)
            .context("initializing orchestration state store")?,
    );
    let action_store = crate::runtime::action_store::ActionStore::new(&config.workspace.state_path)
        .context("initializing action store")?;
    let inbox = crate::runtime::inbox::Inbox::new();

    let state_projection = Arc::new(crate::events::projections::state::StateProjection::new(
        conversation_store.clone(),
    ));
    let stream_projection = Arc::new(crate::events::projections::stream::StreamProjection::new());
    let external_output_projection = Arc::new(
        crate::events::projections::external_output::ExternalOutputProjection::new(
            std::collections::HashSet::new(),
            Box::new(|_channel, _text, _images| Ok(())),
        )
        .context("initializing external output projection")?,
    );
    let markdown_log_projection = Arc::new(
        crate::events::projections::markdown_log::MarkdownLogProjection::new(
            &config.workspace.state_path,
        )
        .context("initializing markdown log projection")?,
    );
    let audit_projection = Arc::new(
        crate::events::projections::audit::AuditProjection::new(&config.workspace.state_path)
            .context("initializing audit projection")?,
    );
    let event_bus = Arc::new(crate::events::EventBus::new(vec![
        state_projection as Arc<dyn crate::events::bus::Projection>,
        stream_projection.clone() as Arc<dyn crate::events::bus::Projection>,
        external_output_projection as Arc<dyn crate::events::bus::Projection>,
        markdown_log_projection as Arc<dyn crate::events::bus::Projection>,
        audit_projection as Arc<dyn crate::events::bus::Projection>,
    ]));
    tracing::info!("event bus ready (state, stream, external_output, markdown_log, audit)");

    // ── Scheduler (§4.9) ──────────────────────────────────────────────
    let orchestration_scheduler = crate::runtime::orchestration_scheduler::OrchestrationScheduler::new(
        config.scheduler.clone(),
        config.workspace.state_path.clone(),
    );
    tracing::info!("orchestration scheduler ready");

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var) {
            Ok(token) if !token.is_empty() => {
                tracing::info!(env_var = %env_var, "API bearer-token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            _ => {
                tracing::warn!(
                    env_var = %env_var,
                    "API bearer-token auth DISABLED — set {env_var} to enable"
                );
                None
            }
        }
    };

    // ── Admin token (read once, hash for constant-time comparison) ──
    let admin_token_hash = {
        let env_var = &config.admin.token_env;
        match std::env::var(env_var) {
            Ok(token) if !token.is_empty() => {
                tracing::info!(env_var = %env_var, "admin bearer-token auth enabled");
                Some(Sha256::digest(token.as_bytes()).to_vec())
            }
            _ => {
                tracing::warn!(
                    env_var = %env_var,
                    "admin bearer-token auth DISABLED — set {env_var} to enable"
                );
                None
            }
        }
    };

    // ── Compile exec denied-patterns at startup ──────────────────────
    let denied_command_set = Arc::new(
        regex::RegexSet::new(&config.tools.exec_security.denied_patterns)
            .context("invalid regex in tools.exec_security.denied_patterns")?,
    );
    tracing::info!(
        patterns = config.tools.exec_security.denied_patterns.len(),
        "exec denied-patterns compiled"
    );

    // ── Compile exec approval-patterns at startup ────────────────────
    let approval_command_set = Arc::new(
        regex::RegexSet::new(&config.tools.exec_security.approval_patterns)
            .context("invalid regex in tools.exec_security.approval_patterns")?,
    );
    tracing::info!(
        patterns = config.tools.exec_security.approval_patterns.len(),
        "exec approval-patterns compiled"
    );
    let approval_store = Arc::new(crate::runtime::approval::ApprovalStore::new(
        std::time::Duration::from_secs(config.tools.exec_security.approval_timeout_sec),
    ));

    // ── MCP servers ──────────────────────────────────────────────────
    let mcp = if config.mcp.servers.is_empty() {
        tracing::info!("no MCP servers configured");
        Arc::new(McpManager::empty())
    } else {
        tracing::info!(count = config.mcp.servers.len(), "initializing MCP servers");
        Arc::new(McpManager::from_config(&config.mcp).await)
    };
    if mcp.tool_count() > 0 {
        tracing::info!(
            servers = mcp.server_count(),
            tools = mcp.tool_count(),
            "MCP tools discovered"
        );
    }

    // ── Config path (for the save-config admin endpoint) ─────────────
    let config_path = std::path::PathBuf::from(
        std::env::var("SA_CONFIG").unwrap_or_else(|_| "config.toml".into()),
    );
    let shutdown_tx = Arc::new(tokio::sync::Notify::new());

    // ── App state (without agents — needed for AgentManager init) ───
    let mut state = AppState {
        config: config.clone(),
        memory,
        skills,
        workspace,
        bootstrap,
        llm,
        smart_router,
        sessions: sessions.clone(),
        identity,
        lifecycle,
        transcripts,
        processes: processes.clone(),
        mcp,
        nodes: nodes.clone(),
        tool_router,
        session_locks: session_locks.clone(),
        cancel_map,
        agents: None,
        dedupe,
        quota_tracker,
        config_path,
        shutdown_tx,
        run_store,
        task_store: task_store.clone(),
        task_runner: task_runner.clone(),
        conversation_store: conversation_store.clone(),
        action_store: action_store.clone(),
        event_bus: event_bus.clone(),
        stream_projection: stream_projection.clone(),
        inbox: inbox.clone(),
        orchestration_scheduler: orchestration_scheduler.clone(),
        skill_engine,
        schedule_store: schedule_store.clone(),
        delivery_store: delivery_store.clone(),
        user_facts_cache: Arc::new(parking_lot::RwLock::new(std::collections::HashMap::new())),
        tool_defs_cache: Arc::new(parking_lot::RwLock::new(std::collections::HashMap::new())),
        api_token_hash,
        admin_token_hash,
        denied_command_set,
        approval_command_set,
        approval_store,
    };

    // ── Agent manager (sub-agents) ──────────────────────────────────
    if !config.agents.is_empty() {
        let agent_mgr = crate::runtime::agent::AgentManager::from_config(&state);
        tracing::info!(agent_count = agent_mgr.len(), "agent manager ready");
        state.agents = Some(Arc::new(agent_mgr));
    }

    Ok(state)
}

/// Spawn the long-running background tokio tasks (session flush, delivery
/// flush, process cleanup, node pruning, schedule runner).
///
/// Call this **after** [`build_app_state`] when running the HTTP server or
/// the interactive chat REPL. One-shot commands (`run`) typically skip it.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Periodic session flush ───────────────────────────────────────
    {
        let sessions = state.sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = sessions.flush().await {
                    tracing::warn!(error = %e, "session store flush failed");
                }
            }
        });
    }

    // ── Periodic delivery flush ──────────────────────────────────────
    {
        let delivery_store = state.delivery_store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                delivery_store.flush_if_dirty().await;
            }
        });
    }

    // ── Periodic process cleanup + session lock pruning + task runner pruning ──
    {
        let processes = state.processes.clone();
        let session_locks = state.session_locks.clone();
        let task_runner = state.task_runner.clone();
        let task_store = state.task_store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                processes.cleanup_stale();
                session_locks.prune_idle();
                task_runner.prune_idle();
                task_store.evict_terminal(chrono::Duration::hours(1));
            }
        });
    }

    // ── Periodic stale node pruning ─────────────────────────────────
    {
        let nodes = state.nodes.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                nodes.prune_stale(120);
            }
        });
    }

    // ── Schedule runner (tick every 30s, trigger due schedules) ───────
    {
        let state_for_sched = state.clone();
        tokio::spawn(async move {
            let runner = crate::runtime::schedule_runner::ScheduleRunner::new();
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                runner.tick(&state_for_sched).await;
            }
        });
    }

    // ── Orchestration scheduler (tick every 30s, fire due ScheduledJobs) ──
    {
        let state_for_orch = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                crate::runtime::orchestration_scheduler::OrchestrationScheduler::tick(&state_for_orch).await;
            }
        });
    }

    // ── Periodic conversation-state cache eviction (idle TTL sweep) ──
    {
        let conversation_store = state.conversation_store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                conversation_store.evict_stale();
            }
        });
    }
    tracing::info!("background tasks spawned");
}
