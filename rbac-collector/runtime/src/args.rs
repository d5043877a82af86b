use crate::{
    controller::Controller,
    core::{ExclusionPolicy, Snapshot},
    index::{
        reflector::{self, ListWatch, Reflector},
        Changes, Mirrored, MirrorMetrics, Mirrors, SharedMirror,
    },
    k8s::{self, Api, Client, ListParams, ResourceExt},
    metrics::ControllerMetrics,
    publish::{self, ConfigMapSink, FileSink, Publish, Sinks},
    server::{self, Surface},
    verify::{self, SubjectAccessReviews},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use prometheus_client::registry::Registry;
use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::Duration};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "rbac-collector",
    about = "Publishes the namespaces each user and group may access",
    version
)]
pub struct Args {
    #[clap(
        long,
        default_value = "rbac_collector=info,warn",
        env = "RBAC_COLLECTOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    sinks: SinkArgs,

    #[clap(flatten)]
    policy: PolicyArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Collects permissions once, publishes them, and exits
    Run,

    /// Watches RBAC resources and republishes permissions whenever they change
    Serve(ServeArgs),

    /// Cross-checks the collected permissions with SubjectAccessReviews
    Verify(VerifyArgs),
}

#[derive(Debug, clap::Args)]
struct SinkArgs {
    /// Name of the ConfigMap that stores the permissions
    #[clap(long, requires = "configmap_namespace")]
    configmap_name: Option<String>,

    /// Namespace of the ConfigMap that stores the permissions
    #[clap(long, requires = "configmap_name")]
    configmap_namespace: Option<String>,

    /// File that stores the permissions
    ///
    /// Defaults to `labels.yaml` when no ConfigMap is configured.
    #[clap(long)]
    output: Option<PathBuf>,

    /// Maximum time to wait for a ConfigMap write
    #[clap(long, default_value = "10")]
    write_timeout_secs: u64,
}

#[derive(Debug, clap::Args)]
struct PolicyArgs {
    /// Namespaces whose role bindings are ignored
    #[clap(long = "exclude-namespace", default_value = crate::core::DEFAULT_EXCLUDED_NAMESPACE)]
    exclude_namespaces: Vec<String>,

    /// Namespace prefixes whose role bindings are ignored
    #[clap(long = "exclude-namespace-prefix")]
    exclude_namespace_prefixes: Vec<String>,

    /// Subjects whose names contain any of these substrings are ignored
    #[clap(
        long = "exclude-subject-substring",
        default_value = crate::core::DEFAULT_EXCLUDED_SUBJECT_SUBSTRING
    )]
    exclude_subject_substrings: Vec<String>,
}

#[derive(Debug, clap::Args)]
struct ServeArgs {
    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Port that serves `/healthz` and `/invoke`
    #[clap(long, default_value = "8081")]
    port: u16,

    /// Delay before the first pass, even if nothing changed
    #[clap(long, default_value = "2")]
    initial_delay_secs: u64,

    /// Minimum time between passes
    #[clap(long, default_value = "5")]
    quiescence_secs: u64,

    /// Delay before reading a watch again after an error event
    #[clap(long, default_value = "5")]
    error_retry_secs: u64,
}

#[derive(Debug, clap::Args)]
struct VerifyArgs {
    #[clap(long, default_value = verify::DEFAULT_VERB)]
    verb: String,

    #[clap(long, default_value = verify::DEFAULT_RESOURCE)]
    resource: String,

    /// Maximum number of SubjectAccessReviews in flight
    #[clap(long, default_value = "16")]
    concurrency: usize,
}

type ReflectorTask = JoinHandle<Result<(), reflector::Error>>;

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            sinks,
            policy,
            command,
        } = self;
        let policy = policy.into_policy();

        match command {
            Command::Serve(serve) => {
                serve
                    .run(log_level, log_format, client, sinks, policy)
                    .await
            }
            Command::Run => {
                log_format
                    .try_init(log_level)
                    .context("failed to configure logging")?;
                let client = client.try_client().await?;
                run_once(client, sinks, policy).await
            }
            Command::Verify(verify) => {
                log_format
                    .try_init(log_level)
                    .context("failed to configure logging")?;
                let client = client.try_client().await?;
                verify.run(client, sinks.output, policy).await
            }
        }
    }
}

/// Lists each kind once, resolves, and publishes.
///
/// Nothing is published unless every list succeeds.
async fn run_once(client: Client, sinks: SinkArgs, policy: ExclusionPolicy) -> Result<()> {
    let snapshot = list_snapshot(&client).await?;
    let index = snapshot.resolve(&policy);
    info!(
        users = index.users.len(),
        groups = index.groups.len(),
        "Collected permissions"
    );

    sinks.build(&client).publish(&index).await?;
    Ok(())
}

async fn list_snapshot(client: &Client) -> Result<Snapshot> {
    Ok(Snapshot {
        roles: list::<k8s::Role>(client).await?,
        cluster_roles: list::<k8s::ClusterRole>(client).await?,
        role_bindings: list::<k8s::RoleBinding>(client).await?,
        cluster_role_bindings: list::<k8s::ClusterRoleBinding>(client).await?,
    })
}

async fn list<T: Mirrored>(client: &Client) -> Result<Vec<T::Entry>> {
    let api = Api::<T>::all(client.clone());
    let (items, _) = <Api<T> as ListWatch<T>>::list(&api)
        .await
        .with_context(|| format!("failed to list {}", T::plural(&())))?;
    Ok(items.iter().map(Mirrored::entry).collect())
}

// === impl SinkArgs ===

impl SinkArgs {
    fn build(self, client: &Client) -> Sinks {
        let mut sinks = Sinks::default();
        if let (Some(name), Some(ns)) = (self.configmap_name, self.configmap_namespace) {
            let timeout = Duration::from_secs(self.write_timeout_secs);
            let sink = ConfigMapSink::new(client.clone(), ns, name).with_timeout(timeout);
            sinks = sinks.push(sink);
        }
        match self.output {
            Some(path) => sinks.push(FileSink::new(path)),
            None if sinks.is_empty() => sinks.push(FileSink::new(publish::DEFAULT_OUTPUT)),
            None => sinks,
        }
    }
}

// === impl PolicyArgs ===

impl PolicyArgs {
    /// Empty values are dropped so that `--exclude-subject-substring=''` disables the filter
    /// instead of excluding every subject.
    fn into_policy(self) -> ExclusionPolicy {
        let non_empty = |values: Vec<String>| {
            values
                .into_iter()
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>()
        };
        ExclusionPolicy {
            namespaces: non_empty(self.exclude_namespaces),
            namespace_prefixes: non_empty(self.exclude_namespace_prefixes),
            subject_substrings: non_empty(self.exclude_subject_substrings),
        }
    }
}

// === impl ServeArgs ===

impl ServeArgs {
    async fn run(
        self,
        log_level: kubert::LogFilter,
        log_format: kubert::LogFormat,
        client: kubert::ClientArgs,
        sinks: SinkArgs,
        policy: ExclusionPolicy,
    ) -> Result<()> {
        let Self {
            admin,
            port,
            initial_delay_secs,
            quiescence_secs,
            error_retry_secs,
        } = self;

        let mut prom = <Registry>::default();
        let mirror_metrics = MirrorMetrics::register(prom.sub_registry_with_prefix("mirror"));
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let client = runtime.client();
        let mirrors = Mirrors::default();
        let changes = Changes::default();
        let config = reflector::Config {
            error_retry_delay: Duration::from_secs(error_retry_secs),
            ..Default::default()
        };

        // Spawn a reflector for each mirrored kind.
        let spawn = Spawn {
            client: &client,
            changes: &changes,
            metrics: &mirror_metrics,
            config: &config,
        };
        let (roles_synced, roles) = spawn.reflector(mirrors.roles.clone());
        let (cluster_roles_synced, cluster_roles) = spawn.reflector(mirrors.cluster_roles.clone());
        let (role_bindings_synced, role_bindings) = spawn.reflector(mirrors.role_bindings.clone());
        let (cluster_role_bindings_synced, cluster_role_bindings) =
            spawn.reflector(mirrors.cluster_role_bindings.clone());

        // Once every mirror holds its first list: report readiness, release the controller, and
        // arm a first pass even if the cluster never changes. If a first list fails, the process
        // exits below and the controller never runs.
        let initialized = runtime.initialized_handle();
        let (controller_tx, controller_rx) = oneshot::channel::<()>();
        tokio::spawn({
            let changes = changes.clone();
            let delay = Duration::from_secs(initial_delay_secs);
            async move {
                let synced = future::try_join4(
                    roles_synced,
                    cluster_roles_synced,
                    role_bindings_synced,
                    cluster_role_bindings_synced,
                );
                if synced.await.is_err() {
                    return;
                }
                info!("Mirrors synced");
                drop(initialized);
                let _ = controller_tx.send(());

                tokio::time::sleep(delay).await;
                changes.signal();
            }
        });
        let synced = async move {
            if controller_rx.await.is_err() {
                future::pending::<()>().await;
            }
        };

        let controller = Controller::new(
            mirrors,
            changes.clone(),
            policy,
            sinks.build(&client),
            controller_metrics,
        )
        .with_quiescence(Duration::from_secs(quiescence_secs));
        tokio::spawn(
            controller
                .run(synced, runtime.shutdown_handle())
                .instrument(info_span!("controller")),
        );

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        tokio::spawn(server::serve(
            listener,
            Surface::new(changes),
            runtime.shutdown_handle(),
        ));

        // Block the main thread on the shutdown signal, failing if a mirror can't get its first
        // list.
        let reflectors =
            future::select_all([roles, cluster_roles, role_bindings, cluster_role_bindings]);
        tokio::select! {
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
                Ok(())
            }
            (res, _, _) = reflectors => match res {
                Ok(Err(error)) => Err(error.into()),
                Ok(Ok(())) => bail!("reflector stopped"),
                Err(error) => Err(error).context("reflector panicked"),
            },
        }
    }
}

/// Shared handles for spawning reflectors.
struct Spawn<'a> {
    client: &'a Client,
    changes: &'a Changes,
    metrics: &'a MirrorMetrics,
    config: &'a reflector::Config,
}

impl Spawn<'_> {
    fn reflector<T: Mirrored>(
        &self,
        mirror: SharedMirror<T>,
    ) -> (oneshot::Receiver<()>, ReflectorTask) {
        let kind = T::kind(&());
        let (synced_tx, synced_rx) = oneshot::channel();
        let reflector = Reflector::new(
            Api::<T>::all(self.client.clone()),
            mirror,
            self.changes.clone(),
            self.metrics.kind(&kind),
            self.config.clone(),
        )
        .with_synced(synced_tx);
        let task = tokio::spawn(
            reflector
                .run()
                .instrument(info_span!("mirror", resource = %T::plural(&()))),
        );
        (synced_rx, task)
    }
}

// === impl VerifyArgs ===

impl VerifyArgs {
    async fn run(
        self,
        client: Client,
        output: Option<PathBuf>,
        policy: ExclusionPolicy,
    ) -> Result<()> {
        let snapshot = list_snapshot(&client).await?;
        let resolved = snapshot.resolve(&policy);

        let namespaces = Api::<k8s::Namespace>::all(client.clone())
            .list(&ListParams::default())
            .await
            .context("failed to list namespaces")?
            .items
            .iter()
            .map(|ns| ns.name_any())
            .filter(|ns| !policy.excludes_namespace(ns))
            .collect::<Vec<_>>();
        let subjects = verify::subjects(&snapshot, &policy);
        info!(
            subjects = subjects.len(),
            namespaces = namespaces.len(),
            "Reviewing access"
        );

        let check = verify::Check {
            verb: self.verb,
            resource: self.resource,
            concurrency: self.concurrency,
        };
        let reviewer = SubjectAccessReviews::new(client);
        let reviewed = verify::review(&reviewer, &subjects, &namespaces, &check).await?;

        let discrepancies = verify::compare(&resolved, &reviewed, &namespaces);
        for d in &discrepancies {
            warn!(
                kind = ?d.subject.kind,
                subject = %d.subject.name,
                missing = ?d.missing,
                unexpected = ?d.unexpected,
                "Resolved access differs from access reviews"
            );
        }
        if discrepancies.is_empty() {
            info!("Resolved access matches access reviews");
        }

        if let Some(path) = output {
            FileSink::new(path).publish(&reviewed).await?;
        }
        Ok(())
    }
}
