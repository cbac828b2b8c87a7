//! Nimbus - workload provisioning from the command line
//!
//! ## Usage
//!
//! ```bash
//! # Compile a descriptor and print the deployment plan
//! nimbus compile --descriptor web.yaml --params web-params.yaml
//!
//! # Create the stack, wait for it, write a record for later scale/delete calls
//! nimbus deploy --descriptor web.yaml --name web --record web.json
//!
//! # Scale out by one increment
//! nimbus scale --record web.json --policy SP1 --direction out
//!
//! # Tear down
//! nimbus delete --record web.json
//!
//! # Generate (and optionally register) a workflow
//! nimbus workflow --target web01 --action deploy --params body.yaml --register
//! ```
//!
//! Connection settings come from `--config` (YAML); the password from
//! `NIMBUS_PASSWORD`.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use nimbus_core::{StackId, WorkflowEngine};
use nimbus_orchestrator::{
    DescriptorCompiler, EngineConfig, HeatClient, KeystoneSession, MistralClient,
    OrchestrationDriver, ParameterTable, RetryBudget, ScaleDirection, ScaleRequest,
    ScalingGroupBinding, WorkflowAction, WorkflowGenerator, WorkloadDescriptor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Nimbus: workload provisioning engine
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Compile workload descriptors and drive their stacks", long_about = None)]
struct Cli {
    /// Engine configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Region used to resolve service endpoints
    #[arg(long, global = true)]
    region: Option<String>,

    /// Status polls per wait (overrides the configuration)
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Seconds between status polls (overrides the configuration)
    #[arg(long, global = true)]
    retry_wait: Option<u64>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DescriptorArgs {
    /// Workload descriptor (YAML or JSON)
    #[arg(long)]
    descriptor: PathBuf,

    /// Parameter table (YAML or JSON mapping)
    #[arg(long)]
    params: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a descriptor into a deployment plan
    Compile {
        #[command(flatten)]
        input: DescriptorArgs,

        /// Write the plan here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Compile, create the stack and wait until it is complete
    Deploy {
        #[command(flatten)]
        input: DescriptorArgs,

        /// Stack name
        #[arg(long)]
        name: String,

        /// Write the deployment record (stack id, scaling bindings) here
        #[arg(long)]
        record: Option<PathBuf>,
    },

    /// Signal a scaling policy and wait for the group to settle
    Scale {
        /// Deployment record written by `deploy`
        #[arg(long)]
        record: PathBuf,

        /// Scaling policy name
        #[arg(long)]
        policy: String,

        /// out or in
        #[arg(long)]
        direction: ScaleDirection,
    },

    /// Delete a stack
    Delete {
        /// Deployment record written by `deploy`
        #[arg(long, conflicts_with = "stack_id", required_unless_present = "stack_id")]
        record: Option<PathBuf>,

        #[arg(long)]
        stack_id: Option<String>,

        /// Return once deletion is requested
        #[arg(long)]
        no_wait: bool,
    },

    /// List the physical resources of a stack
    Inventory {
        #[arg(long)]
        stack_id: String,
    },

    /// Generate a workflow definition
    Workflow {
        /// Target the workflow acts on
        #[arg(long)]
        target: String,

        /// deploy, teardown, health_probe or maintenance
        #[arg(long)]
        action: WorkflowAction,

        /// Workflow parameters (YAML or JSON mapping)
        #[arg(long)]
        params: Option<PathBuf>,

        /// Register the definition with the workflow engine
        #[arg(long)]
        register: bool,

        /// Register and start an execution
        #[arg(long)]
        execute: bool,
    },
}

/// What `deploy` leaves behind for `scale` and `delete`
#[derive(Debug, Serialize, Deserialize)]
struct DeploymentRecord {
    stack_id: StackId,
    stack_name: String,
    #[serde(default)]
    bindings: ScalingGroupBinding,
    #[serde(default)]
    alarm_tags: BTreeMap<String, String>,
}

impl DeploymentRecord {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading deployment record {}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing deployment record {}", path.display()))
    }
}

/// Connected collaborators, built once per invocation
struct Session {
    config: EngineConfig,
    identity: Arc<KeystoneSession>,
    heat: Arc<HeatClient>,
}

impl Session {
    fn connect(config: EngineConfig) -> anyhow::Result<Self> {
        let identity = Arc::new(KeystoneSession::new(config.identity.clone())?);
        let mut heat = HeatClient::new(identity.clone())?;
        if let Some(region) = &config.identity.region {
            heat = heat.with_region(region.clone());
        }
        Ok(Self {
            config,
            identity,
            heat: Arc::new(heat),
        })
    }

    fn driver(&self) -> OrchestrationDriver {
        OrchestrationDriver::new(self.heat.clone(), self.config.driver.clone())
    }

    fn compiler(&self) -> DescriptorCompiler {
        DescriptorCompiler::new(self.config.compiler.clone())
    }

    fn budget(&self) -> RetryBudget {
        self.config.driver.budget()
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default().with_env_overrides(),
    };
    if let Some(region) = &cli.region {
        config.identity.region = Some(region.clone());
    }
    if let Some(retries) = cli.retries {
        config.driver = config.driver.with_stack_retries(retries);
    }
    if let Some(secs) = cli.retry_wait {
        config.driver = config.driver.with_retry_wait_secs(secs);
    }
    Ok(config)
}

fn load_inputs(input: &DescriptorArgs) -> anyhow::Result<(WorkloadDescriptor, Option<ParameterTable>)> {
    let text = std::fs::read_to_string(&input.descriptor)
        .with_context(|| format!("reading descriptor {}", input.descriptor.display()))?;
    let descriptor = WorkloadDescriptor::from_yaml(&text)?;
    let params = match &input.params {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading parameters {}", path.display()))?;
            Some(ParameterTable::from_yaml(&text)?)
        }
        None => None,
    };
    Ok((descriptor, params))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let (file_layer, _log_guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "nimbus.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nimbus=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let config = load_config(&cli)?;
    let session = Session::connect(config)?;

    match cli.command {
        Commands::Compile { input, output } => compile(&session, &input, output.as_deref()).await,
        Commands::Deploy { input, name, record } => deploy(&session, &input, &name, record.as_deref()).await,
        Commands::Scale {
            record,
            policy,
            direction,
        } => scale(&session, &record, policy, direction).await,
        Commands::Delete {
            record,
            stack_id,
            no_wait,
        } => {
            let stack_id = match (record, stack_id) {
                (Some(path), _) => DeploymentRecord::load(&path)?.stack_id,
                (None, Some(id)) => StackId::new(id),
                (None, None) => anyhow::bail!("--record or --stack-id required"),
            };
            delete(&session, &stack_id, no_wait).await
        }
        Commands::Inventory { stack_id } => {
            let inventory = session
                .driver()
                .resource_inventory(&StackId::new(stack_id))
                .await?;
            print_json(&inventory)
        }
        Commands::Workflow {
            target,
            action,
            params,
            register,
            execute,
        } => workflow(&session, &target, action, params.as_deref(), register || execute, execute).await,
    }
}

async fn compile(session: &Session, input: &DescriptorArgs, output: Option<&Path>) -> anyhow::Result<()> {
    let (descriptor, params) = load_inputs(input)?;
    let plan = session
        .compiler()
        .plan(&descriptor, params.as_ref(), session.heat.as_ref())
        .await?;

    let rendered = serde_json::json!({
        "template": plan.graph.to_template(),
        "files": plan.graph.files().keys().collect::<Vec<_>>(),
        "bindings": plan.bindings,
        "alarm_tags": plan.alarm_tags,
        "monitoring": plan.monitoring,
    });
    match output {
        Some(path) => {
            std::fs::write(path, serde_json::to_string_pretty(&rendered)?)
                .with_context(|| format!("writing plan {}", path.display()))?;
            info!(path = %path.display(), "Plan written");
            Ok(())
        }
        None => print_json(&rendered),
    }
}

async fn deploy(session: &Session, input: &DescriptorArgs, name: &str, record: Option<&Path>) -> anyhow::Result<()> {
    let (descriptor, params) = load_inputs(input)?;
    let plan = session
        .compiler()
        .plan(&descriptor, params.as_ref(), session.heat.as_ref())
        .await?;

    let driver = session.driver();
    let stack_id = driver.create(name, &plan.graph).await?;

    let deployment = DeploymentRecord {
        stack_id: stack_id.clone(),
        stack_name: name.to_string(),
        bindings: plan.bindings.clone(),
        alarm_tags: plan.alarm_tags.clone(),
    };
    if let Some(path) = record {
        deployment.save(path)?;
    }

    let endpoints: BTreeMap<String, Value> = if plan.bindings.is_empty() {
        driver.wait_create(&stack_id, session.budget()).await?
    } else {
        driver
            .wait_create_grouped(&stack_id, &plan.bindings, session.budget())
            .await?
            .into_iter()
            .map(|(component, addresses)| (component, Value::from(addresses)))
            .collect()
    };

    info!(stack_id = %stack_id, endpoints = endpoints.len(), "Deployment complete");
    print_json(&serde_json::json!({
        "stack_id": stack_id,
        "management_endpoints": endpoints,
        "monitoring": plan.monitoring,
    }))
}

async fn scale(session: &Session, record: &Path, policy: String, direction: ScaleDirection) -> anyhow::Result<()> {
    let deployment = DeploymentRecord::load(record)?;
    let driver = session.driver();
    let request = ScaleRequest::new(policy, direction);

    let token = driver
        .scale(&deployment.stack_id, &deployment.bindings, &request)
        .await?;
    let endpoints = driver
        .wait_scale(
            &deployment.stack_id,
            &deployment.bindings,
            &request,
            &token,
            session.budget(),
        )
        .await?;
    print_json(&endpoints)
}

async fn delete(session: &Session, stack_id: &StackId, no_wait: bool) -> anyhow::Result<()> {
    let driver = session.driver();
    driver.delete(stack_id).await?;
    if no_wait {
        info!(stack_id = %stack_id, "Deletion requested");
        return Ok(());
    }
    driver.wait_delete(stack_id, session.budget()).await?;
    info!(stack_id = %stack_id, "Stack deleted");
    Ok(())
}

async fn workflow(
    session: &Session,
    target: &str,
    action: WorkflowAction,
    params: Option<&Path>,
    register: bool,
    execute: bool,
) -> anyhow::Result<()> {
    let params: BTreeMap<String, Value> = match params {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading workflow parameters {}", path.display()))?;
            serde_yaml::from_str(&text)?
        }
        None => BTreeMap::new(),
    };
    let graph = WorkflowGenerator::new().build(target, action, &params)?;
    let definition = graph.to_yaml()?;

    if !register {
        print!("{}", definition);
        return Ok(());
    }

    let mut engine = MistralClient::new(session.identity.clone())?;
    if let Some(region) = &session.config.identity.region {
        engine = engine.with_region(region.clone());
    }

    // A definition left over from an earlier run blocks re-registration
    if let Err(e) = engine.delete_workflow(&graph.name).await {
        if !e.is_not_found() {
            warn!(workflow = %graph.name, error = %e, "Could not remove previous definition");
        }
    }
    let name = engine.create_workflow(&definition).await?;

    if execute {
        let execution_id = engine.execute(&name, &graph.input_values).await?;
        print_json(&serde_json::json!({ "workflow": name, "execution_id": execution_id }))
    } else {
        print_json(&serde_json::json!({ "workflow": name }))
    }
}

