//! Artifact graph resolution
//!
//! Artifacts are identified by [`ArtifactKind`]. Each kind declares the
//! kinds it requires and has one constructor. The [`Resolver`] walks the
//! requirement edges in topological order, builds each artifact at most
//! once, and hands back shared references to the cached values so every
//! stage of one install attempt sees byte-identical content.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use mantle_common::error::UNKNOWN_CONTEXT;
use mantle_common::model::Cluster;
use mantle_common::{Error, Result, Settings};

use crate::artifacts::{
    build_install_config, build_master_machines, build_platform_credentials,
    build_pointer_ignition, build_ssh_public_key, build_worker_machine_sets, Ignition,
    InstallConfig, Machine, MachineSet, PlatformCredentials,
};

/// Stage name reported when resolution fails
pub const RESOLVE_STAGE: &str = "resolve-artifacts";

/// Every artifact the install pipeline consumes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    /// `authorized_keys` line derived from the stored private key
    SshPublicKey,
    /// Service principal credentials bundle
    PlatformCredentials,
    /// Installer configuration
    InstallConfig,
    /// Control plane machine definitions
    MasterMachines,
    /// Compute machine sets
    WorkerMachineSets,
    /// Control plane pointer ignition
    MasterIgnition,
    /// Compute pointer ignition
    WorkerIgnition,
}

impl ArtifactKind {
    /// All kinds, in declaration order
    pub const ALL: [ArtifactKind; 7] = [
        ArtifactKind::SshPublicKey,
        ArtifactKind::PlatformCredentials,
        ArtifactKind::InstallConfig,
        ArtifactKind::MasterMachines,
        ArtifactKind::WorkerMachineSets,
        ArtifactKind::MasterIgnition,
        ArtifactKind::WorkerIgnition,
    ];

    /// Kinds that must be resolved before this one
    pub fn requires(self) -> &'static [ArtifactKind] {
        match self {
            ArtifactKind::SshPublicKey | ArtifactKind::PlatformCredentials => &[],
            ArtifactKind::InstallConfig => &[ArtifactKind::SshPublicKey],
            ArtifactKind::MasterMachines
            | ArtifactKind::WorkerMachineSets
            | ArtifactKind::MasterIgnition
            | ArtifactKind::WorkerIgnition => &[ArtifactKind::InstallConfig],
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A resolved artifact
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Artifact {
    /// See [`ArtifactKind::SshPublicKey`]
    SshPublicKey(String),
    /// See [`ArtifactKind::PlatformCredentials`]
    PlatformCredentials(PlatformCredentials),
    /// See [`ArtifactKind::InstallConfig`]
    InstallConfig(InstallConfig),
    /// See [`ArtifactKind::MasterMachines`]
    MasterMachines(Vec<Machine>),
    /// See [`ArtifactKind::WorkerMachineSets`]
    WorkerMachineSets(Vec<MachineSet>),
    /// See [`ArtifactKind::MasterIgnition`]
    MasterIgnition(Ignition),
    /// See [`ArtifactKind::WorkerIgnition`]
    WorkerIgnition(Ignition),
}

impl Artifact {
    /// Kind tag of this artifact
    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::SshPublicKey(_) => ArtifactKind::SshPublicKey,
            Artifact::PlatformCredentials(_) => ArtifactKind::PlatformCredentials,
            Artifact::InstallConfig(_) => ArtifactKind::InstallConfig,
            Artifact::MasterMachines(_) => ArtifactKind::MasterMachines,
            Artifact::WorkerMachineSets(_) => ArtifactKind::WorkerMachineSets,
            Artifact::MasterIgnition(_) => ArtifactKind::MasterIgnition,
            Artifact::WorkerIgnition(_) => ArtifactKind::WorkerIgnition,
        }
    }

    /// Canonical JSON encoding
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::serialization_for_kind(self.kind().to_string(), e.to_string()))
    }
}

/// Order `roots` and their transitive requirements so each kind follows
/// everything it requires
///
/// Generic over the node type so the walk can be checked against
/// arbitrary graphs. A cycle is a programming error and fails immediately.
pub fn topological_order<K, F>(roots: &[K], requires: F) -> Result<Vec<K>>
where
    K: Copy + Ord + fmt::Debug,
    F: Fn(K) -> Vec<K>,
{
    fn visit<K, F>(
        node: K,
        requires: &F,
        done: &mut BTreeSet<K>,
        path: &mut Vec<K>,
        out: &mut Vec<K>,
    ) -> Result<()>
    where
        K: Copy + Ord + fmt::Debug,
        F: Fn(K) -> Vec<K>,
    {
        if done.contains(&node) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let cycle: Vec<String> = path[pos..]
                .iter()
                .chain(std::iter::once(&node))
                .map(|n| format!("{:?}", n))
                .collect();
            return Err(Error::install(
                UNKNOWN_CONTEXT,
                RESOLVE_STAGE,
                format!("artifact dependency cycle: {}", cycle.join(" -> ")),
            ));
        }
        path.push(node);
        for dep in requires(node) {
            visit(dep, requires, done, path, out)?;
        }
        path.pop();
        done.insert(node);
        out.push(node);
        Ok(())
    }

    let mut done = BTreeSet::new();
    let mut out = Vec::new();
    for root in roots {
        visit(*root, &requires, &mut done, &mut Vec::new(), &mut out)?;
    }
    Ok(out)
}

/// Builds and caches artifacts for one install attempt
pub struct Resolver {
    cluster: Cluster,
    settings: Settings,
    cache: BTreeMap<ArtifactKind, Arc<Artifact>>,
}

impl Resolver {
    /// A resolver over a snapshot of the cluster
    pub fn new(cluster: Cluster, settings: Settings) -> Self {
        Self {
            cluster,
            settings,
            cache: BTreeMap::new(),
        }
    }

    /// Resolve `kind` and everything it requires
    pub fn get(&mut self, kind: ArtifactKind) -> Result<Arc<Artifact>> {
        for k in topological_order(&[kind], |k| k.requires().to_vec())? {
            if !self.cache.contains_key(&k) {
                let artifact = self.construct(k)?;
                debug!(artifact = %k, "resolved artifact");
                self.cache.insert(k, Arc::new(artifact));
            }
        }
        self.cached(kind)
    }

    /// Resolve every kind into an immutable graph
    pub fn resolve_all(mut self) -> Result<ArtifactGraph> {
        for kind in ArtifactKind::ALL {
            self.get(kind)?;
        }
        Ok(ArtifactGraph {
            artifacts: self.cache,
        })
    }

    fn cached(&self, kind: ArtifactKind) -> Result<Arc<Artifact>> {
        self.cache.get(&kind).cloned().ok_or_else(|| {
            Error::internal_with_context("resolver", format!("{} was not resolved", kind))
        })
    }

    fn install_config(&self) -> Result<InstallConfig> {
        match self.cached(ArtifactKind::InstallConfig)?.as_ref() {
            Artifact::InstallConfig(c) => Ok(c.clone()),
            other => Err(mismatch(ArtifactKind::InstallConfig, other)),
        }
    }

    fn construct(&self, kind: ArtifactKind) -> Result<Artifact> {
        let cluster_id = &self.cluster.properties.cluster_id;
        Ok(match kind {
            ArtifactKind::SshPublicKey => Artifact::SshPublicKey(build_ssh_public_key(&self.cluster)?),
            ArtifactKind::PlatformCredentials => {
                Artifact::PlatformCredentials(build_platform_credentials(&self.cluster)?)
            }
            ArtifactKind::InstallConfig => {
                let ssh_key = match self.cached(ArtifactKind::SshPublicKey)?.as_ref() {
                    Artifact::SshPublicKey(k) => k.clone(),
                    other => return Err(mismatch(ArtifactKind::SshPublicKey, other)),
                };
                Artifact::InstallConfig(build_install_config(&self.cluster, &self.settings, &ssh_key)?)
            }
            ArtifactKind::MasterMachines => {
                Artifact::MasterMachines(build_master_machines(cluster_id, &self.install_config()?))
            }
            ArtifactKind::WorkerMachineSets => Artifact::WorkerMachineSets(
                build_worker_machine_sets(cluster_id, &self.install_config()?),
            ),
            ArtifactKind::MasterIgnition => {
                Artifact::MasterIgnition(build_pointer_ignition(&self.install_config()?, "master"))
            }
            ArtifactKind::WorkerIgnition => {
                Artifact::WorkerIgnition(build_pointer_ignition(&self.install_config()?, "worker"))
            }
        })
    }
}

fn mismatch(expected: ArtifactKind, found: &Artifact) -> Error {
    Error::internal_with_context(
        "resolver",
        format!("expected {} artifact, found {}", expected, found.kind()),
    )
}

/// All artifacts of one install attempt
#[derive(Debug)]
pub struct ArtifactGraph {
    artifacts: BTreeMap<ArtifactKind, Arc<Artifact>>,
}

impl ArtifactGraph {
    /// Look up any artifact
    pub fn get(&self, kind: ArtifactKind) -> Result<&Artifact> {
        self.artifacts.get(&kind).map(Arc::as_ref).ok_or_else(|| {
            Error::internal_with_context("artifact graph", format!("{} is missing", kind))
        })
    }

    /// The install config
    pub fn install_config(&self) -> Result<&InstallConfig> {
        match self.get(ArtifactKind::InstallConfig)? {
            Artifact::InstallConfig(c) => Ok(c),
            other => Err(mismatch(ArtifactKind::InstallConfig, other)),
        }
    }

    /// The control plane machines
    pub fn master_machines(&self) -> Result<&[Machine]> {
        match self.get(ArtifactKind::MasterMachines)? {
            Artifact::MasterMachines(m) => Ok(m),
            other => Err(mismatch(ArtifactKind::MasterMachines, other)),
        }
    }

    /// The control plane ignition
    pub fn master_ignition(&self) -> Result<&Ignition> {
        match self.get(ArtifactKind::MasterIgnition)? {
            Artifact::MasterIgnition(i) => Ok(i),
            other => Err(mismatch(ArtifactKind::MasterIgnition, other)),
        }
    }

    /// Canonical bytes of every artifact, keyed by kind
    pub fn fingerprint(&self) -> Result<BTreeMap<ArtifactKind, Vec<u8>>> {
        self.artifacts
            .iter()
            .map(|(k, a)| Ok((*k, a.to_bytes()?)))
            .collect()
    }
}
