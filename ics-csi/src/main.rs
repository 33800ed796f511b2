mod cli;
mod driver;

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Parser;
use libics::backend::ics::{PARAM_DATASTORE, PARAM_FS_TYPE};
use libics::config::DriverConfig;
use libics::{
    AccessType, CreateVolumeRequest, CsiController, CsiIdentity, Task, TaskPoller, VirtualMachine,
    VolumeCapability, VolumeId,
};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, LogFormat, NodesCommand, TaskCommand, VolumeCommand, parse_node};
use crate::driver::Driver;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Brief form of a VM for output; the full management-plane document is
/// large.
fn vm_summary(vm: &VirtualMachine) -> serde_json::Value {
    json!({
        "uuid": vm.uuid,
        "name": vm.name,
        "id": vm.id(),
        "virtualCenter": vm.virtual_center_host,
        "datacenter": vm.datacenter.name,
        "disks": vm
            .info
            .disks
            .iter()
            .map(|disk| json!({ "id": disk.id, "scsiId": disk.scsi_id }))
            .collect::<Vec<_>>(),
    })
}

/// Register a node for this invocation. A node whose VM is not found by
/// name stays registered so its UUID can still come from Kubernetes.
async fn ensure_node(driver: &Driver, name: &str, uuid: &str) -> Result<()> {
    match driver.nodes().register_node(uuid, name).await {
        Err(e) if e.is_vm_not_found() && uuid.is_empty() => {
            warn!(node = name, "no VM named after node, trying kubernetes");
            Ok(())
        }
        res => res.with_context(|| format!("failed to register node {name}")),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = DriverConfig::load_or_default(cli.config.as_deref())
        .context("failed to load driver configuration")?;
    let driver = Driver::connect(&config, cli.insecure, !cli.no_kube).await?;
    let backend = &driver.backend;

    match cli.command {
        Command::Resolve(args) => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });
            let vm = driver
                .resolver
                .resolve_with_cancel(&args.name, &args.uuid, &cancel)
                .await
                .with_context(|| {
                    format!("failed to resolve VM (name: {:?}, uuid: {:?})", args.name, args.uuid)
                })?;
            print(&vm_summary(&vm))
        }

        Command::Nodes(NodesCommand::Get { name, uuid }) => {
            ensure_node(&driver, &name, &uuid).await?;
            let vm = driver.nodes().get_node_by_name(&name).await?;
            print(&vm_summary(&vm))
        }

        Command::Nodes(NodesCommand::List { nodes }) => {
            for arg in &nodes {
                let (name, uuid) = parse_node(arg);
                ensure_node(&driver, name, uuid).await?;
            }
            let vms = driver.nodes().get_all_nodes().await?;
            print(&vms.iter().map(vm_summary).collect::<Vec<_>>())
        }

        Command::Volume(VolumeCommand::Create {
            name,
            capacity_bytes,
            datastore,
            fs_type,
        }) => {
            let mut parameters = HashMap::from([(PARAM_DATASTORE.to_owned(), datastore)]);
            if let Some(fs_type) = fs_type {
                parameters.insert(PARAM_FS_TYPE.to_owned(), fs_type);
            }
            let volume = backend
                .create_volume(CreateVolumeRequest {
                    name,
                    capacity_bytes,
                    parameters,
                    ..Default::default()
                })
                .await
                .context("failed to create volume")?;
            print(&volume)
        }

        Command::Volume(VolumeCommand::Delete { id }) => {
            backend
                .delete_volume(&VolumeId(id.clone()))
                .await
                .with_context(|| format!("failed to delete volume {id}"))?;
            info!(volume_id = %id, "deleted");
            Ok(())
        }

        Command::Volume(VolumeCommand::Expand {
            id,
            capacity_bytes,
            block,
        }) => {
            let capability = block.then(|| VolumeCapability {
                access_type: AccessType::Block,
                ..Default::default()
            });
            let resp = backend
                .controller_expand_volume(&VolumeId(id.clone()), capacity_bytes, capability.as_ref())
                .await
                .with_context(|| format!("failed to expand volume {id}"))?;
            print(&resp)
        }

        Command::Volume(VolumeCommand::Attach {
            id,
            node,
            node_uuid,
        }) => {
            ensure_node(&driver, &node, &node_uuid).await?;
            let ctx = backend
                .controller_publish_volume(&VolumeId(id.clone()), &node)
                .await
                .with_context(|| format!("failed to attach volume {id} to {node}"))?;
            print(&ctx)
        }

        Command::Volume(VolumeCommand::Detach {
            id,
            node,
            node_uuid,
        }) => {
            ensure_node(&driver, &node, &node_uuid).await?;
            backend
                .controller_unpublish_volume(&VolumeId(id.clone()), &node)
                .await
                .with_context(|| format!("failed to detach volume {id} from {node}"))?;
            info!(volume_id = %id, %node, "detached");
            Ok(())
        }

        Command::Task(TaskCommand::Wait { host, id }) => {
            let vc = driver.registry.get(&host)?;
            let api = vc.client().await?;
            let outcome = TaskPoller::default()
                .poll(api.as_ref(), &Task::new(id))
                .await?;
            print(&json!({
                "taskId": outcome.task.task_id,
                "state": outcome.state.as_str(),
                "detail": outcome.detail,
                "polls": outcome.polls,
            }))
        }

        Command::Info => {
            print(&json!({
                "plugin": backend.get_plugin_info().await?,
                "ready": backend.probe().await?,
                "capabilities": backend.get_plugin_capabilities().await?,
            }))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    run(cli).await
}
