//! Ways to bring a container to life.
//!
//! - [`InProcessLauncher`]: a tokio task in the current process, linked by
//!   channels. Used for the master container and in tests.
//! - [`ProcessLauncher`]: re-executes the current binary with
//!   [`CONTAINER_ENV`] set and talks to it over stdin/stdout. The child's
//!   `main` must call [`worker::run_if_requested`](crate::worker::run_if_requested)
//!   first.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use cairn_framework::{App, PluginCatalog};
use cairn_transport::{ContainerDescriptor, Frame, Link};

use crate::container::Container;
use crate::error::{RuntimeError, RuntimeResult};

/// Set in a child process to the name of the container it hosts.
pub const CONTAINER_ENV: &str = "CAIRN_CONTAINER";

/// A launched container, as seen by the cluster.
pub struct Launched {
    /// Frame channels to the container.
    pub link: Link,
    /// The container's application, when it lives in this process.
    pub app: Option<App>,
    /// The child process, when it lives in another one.
    pub child: Option<Child>,
    /// The task running the container, when it lives in this process.
    pub task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Launched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launched")
            .field("in_process", &self.app.is_some())
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .finish()
    }
}

/// Starts a container and hands it its descriptor.
///
/// The returned link must deliver the container's `Attached` frame first.
#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    async fn launch(&self, descriptor: &ContainerDescriptor) -> RuntimeResult<Launched>;
}

// =============================================================================
// InProcessLauncher
// =============================================================================

/// Runs containers as tasks of the current runtime.
#[derive(Clone, Debug)]
pub struct InProcessLauncher {
    catalog: PluginCatalog,
}

impl InProcessLauncher {
    pub fn new(catalog: PluginCatalog) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl ContainerLauncher for InProcessLauncher {
    async fn launch(&self, descriptor: &ContainerDescriptor) -> RuntimeResult<Launched> {
        let container = Container::configure(descriptor.clone(), &self.catalog).await?;
        let app = container.app().clone();
        let (cluster_end, container_end) = Link::pair();

        let name = descriptor.name.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = container.run(container_end).await {
                error!(container = %name, error = %e, "Container stopped with an error");
            }
        });

        debug!(container = %descriptor.name, "Container launched in process");
        Ok(Launched {
            link: cluster_end,
            app: Some(app),
            child: None,
            task: Some(task),
        })
    }
}

// =============================================================================
// ProcessLauncher
// =============================================================================

/// Runs each container in a child process of the current executable.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: Option<PathBuf>,
    args: Vec<OsString>,
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessLauncher {
    /// Re-executes the current binary with the current arguments.
    pub fn new() -> Self {
        Self {
            program: None,
            args: std::env::args_os().skip(1).collect(),
        }
    }

    /// Runs `program` instead of the current binary.
    pub fn program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Replaces the child's arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn program_path(&self) -> RuntimeResult<PathBuf> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }
}

#[async_trait]
impl ContainerLauncher for ProcessLauncher {
    async fn launch(&self, descriptor: &ContainerDescriptor) -> RuntimeResult<Launched> {
        let program = self.program_path()?;
        let mut child = Command::new(&program)
            .args(&self.args)
            .env(CONTAINER_ENV, &descriptor.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::launch(&descriptor.name, e))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(RuntimeError::launch(
                &descriptor.name,
                "child stdio was not captured",
            ));
        };

        let link = Link::spawn(&descriptor.name, stdout, stdin);
        link.tx
            .send(Frame::Configure(descriptor.clone()))
            .map_err(|_| RuntimeError::launch(&descriptor.name, "child link closed"))?;

        info!(
            container = %descriptor.name,
            program = %program.display(),
            pid = ?child.id(),
            "Container process spawned"
        );
        Ok(Launched {
            link,
            app: None,
            child: Some(child),
            task: None,
        })
    }
}
