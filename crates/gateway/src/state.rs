//! Composition root.
//!
//! `AppState` owns every process-wide registry — tool catalog, chain
//! rules, pricing, approval gate, scheduler stores — and hands them to the
//! runner as explicit dependencies.  Nothing in the runtime reaches for a
//! global.

use std::sync::Arc;
use std::time::Duration;

use cadence_domain::config::Config;
use cadence_domain::error::Result;
use cadence_mcp_client::McpClient;
use cadence_providers::{LlmProvider, OpenAiCompatProvider};
use cadence_sessions::SessionStore;
use cadence_tools::{ChainRegistry, ChainRule, ChainStep, ToolCatalog, ToolDescriptor};

use crate::persist::ResponseStore;
use crate::runtime::approval::ApprovalGate;
use crate::runtime::files::SessionFileClient;
use crate::runtime::invoker::Invoker;
use crate::runtime::notify::NotificationClient;
use crate::runtime::scheduler::store::TaskStore;
use crate::runtime::tasks::TaskToolService;
use crate::runtime::todo::TodoService;
use crate::runtime::tools_exec::ToolRouter;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn LlmProvider>,
    pub sessions: Arc<SessionStore>,
    pub catalog: Arc<ToolCatalog>,
    pub chains: Arc<ChainRegistry>,
    pub approval: Arc<ApprovalGate>,
    pub invoker: Arc<Invoker>,
    pub tools: Arc<ToolRouter>,
    pub todo: Arc<TodoService>,
    pub mcp: Arc<McpClient>,
    pub task_store: Arc<TaskStore>,
    pub notify: Arc<NotificationClient>,
    pub persist: Arc<ResponseStore>,
}

impl AppState {
    /// Build the full state from config with the default provider.
    pub fn build(config: Config) -> Result<Self> {
        let provider: Arc<dyn LlmProvider> =
            Arc::new(OpenAiCompatProvider::from_config(&config.llm)?);
        Self::build_with_provider(config, provider)
    }

    /// Build the state around an explicit provider (tests inject mocks
    /// here).
    pub fn build_with_provider(config: Config, provider: Arc<dyn LlmProvider>) -> Result<Self> {
        let config = Arc::new(config);

        let sessions = Arc::new(SessionStore::new(
            Duration::from_secs(config.agent.session_ttl_seconds),
            config.agent.max_sessions,
        ));
        let catalog = Arc::new(ToolCatalog::new());
        let chains = Arc::new(ChainRegistry::new());
        let approval = Arc::new(ApprovalGate::new());
        let mcp = Arc::new(McpClient::new(&config.mcp));
        let todo = Arc::new(TodoService::new());
        let notify = Arc::new(NotificationClient::new(&config.platform));
        let files = Arc::new(SessionFileClient::new(&config.platform));
        let task_store = Arc::new(TaskStore::new(&config.server.state_path)?);
        let tasks = Arc::new(TaskToolService::new(
            config.scheduler.default_timezone.clone(),
        ));
        let persist = Arc::new(ResponseStore::new(
            &config.server.state_path,
            config.llm.pricing.clone(),
        ));

        let invoker = Arc::new(Invoker::new(
            provider.clone(),
            sessions.clone(),
            catalog.clone(),
            config.agent.clone(),
            config.compaction.clone(),
        ));

        let tools = Arc::new(ToolRouter::new(
            todo.clone(),
            notify.clone(),
            files.clone(),
            tasks,
            task_store.clone(),
            sessions.clone(),
            mcp.clone(),
            Duration::from_secs(config.agent.tool_timeout_secs),
        ));

        Ok(Self {
            config,
            provider,
            sessions,
            catalog,
            chains,
            approval,
            invoker,
            tools,
            todo,
            mcp,
            task_store,
            notify,
            persist,
        })
    }

    /// Refresh MCP-discovered tools: update the catalog and re-register
    /// chain rules and approval flags from tool metadata.
    pub async fn refresh_external_tools(&self) {
        let discovered = self.mcp.discover_tools().await;
        if discovered.is_empty() {
            return;
        }

        self.chains.clear();
        let mut descriptors = Vec::with_capacity(discovered.len());
        for tool in &discovered {
            if !tool.chain.is_empty() {
                self.chains.register(ChainRule {
                    source: tool.name.clone(),
                    steps: tool
                        .chain
                        .iter()
                        .map(|step| ChainStep {
                            target: step.target.clone(),
                            extract: step.extract.clone(),
                            arg_mapping: step.arg_mapping.clone(),
                        })
                        .collect(),
                });
            }
            let mut descriptor = ToolDescriptor::server(
                &tool.name,
                &tool.description,
                tool.parameters.clone(),
            );
            descriptor.requires_approval = tool.requires_approval;
            descriptors.push(descriptor);
        }
        self.catalog.set_external(descriptors);

        tracing::info!(
            tools = discovered.len(),
            chain_sources = ?self.chains.rule_sources(),
            "external tools refreshed"
        );
    }

    /// Drop per-session runtime state when a session goes away.
    pub fn clear_session_state(&self, session_id: &str) {
        self.approval.clear_session(session_id);
        self.chains.clear_session(session_id);
        self.todo.clear_session(session_id);
    }
}
