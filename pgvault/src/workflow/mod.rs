//! Operation workflows: every request is served by a chain of stages,
//! each with `setup`, `execute` and `teardown`. Execution is sequential;
//! teardown runs in reverse order for every stage whose setup completed,
//! whether or not the chain succeeded.

pub mod backup;
pub mod maintenance;
pub mod restore;

use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{Backup, Catalog};
use crate::client::basebackup::BaseBackupResult;
use crate::conf::{EngineState, ServerConf, ServerFlags, ServerVersionInfo};
use crate::error::{Error, ErrorKind, Result, StageError};
use crate::restore::RestorePosition;

/// Typed requests delivered by the admin channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Backup {
        server: String,
    },
    IncrementalBackup {
        server: String,
        /// Parent to increment from; defaults to the newest valid backup.
        #[serde(default)]
        base: Option<String>,
    },
    Restore {
        server: String,
        identifier: String,
        #[serde(default)]
        position: Option<String>,
        destination: String,
    },
    Archive {
        server: String,
        identifier: String,
        destination: String,
    },
    Delete {
        server: String,
        identifier: String,
        #[serde(default)]
        force: bool,
    },
    Retention {
        #[serde(default)]
        server: Option<String>,
    },
    Verify {
        server: String,
        identifier: String,
    },
    Annotate {
        server: String,
        identifier: String,
        key: String,
        value: String,
    },
    List {
        server: String,
    },
}

impl Operation {
    pub fn server(&self) -> Option<&str> {
        match self {
            Operation::Backup { server }
            | Operation::IncrementalBackup { server, .. }
            | Operation::Restore { server, .. }
            | Operation::Archive { server, .. }
            | Operation::Delete { server, .. }
            | Operation::Verify { server, .. }
            | Operation::Annotate { server, .. }
            | Operation::List { server } => Some(server),
            Operation::Retention { server } => server.as_deref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Backup { .. } => "backup",
            Operation::IncrementalBackup { .. } => "incremental_backup",
            Operation::Restore { .. } => "restore",
            Operation::Archive { .. } => "archive",
            Operation::Delete { .. } => "delete",
            Operation::Retention { .. } => "retention",
            Operation::Verify { .. } => "verify",
            Operation::Annotate { .. } => "annotate",
            Operation::List { .. } => "list",
        }
    }
}

/// Mutable state threaded between the stages of one chain. Nothing in
/// here outlives the workflow.
pub struct WorkflowContext {
    pub state: Arc<EngineState>,
    pub server: ServerConf,
    pub flags: Arc<ServerFlags>,
    pub cancel: CancellationToken,

    /// Label of the backup the chain operates on.
    pub label: String,
    pub backup: Option<Backup>,
    pub version: Option<ServerVersionInfo>,
    pub basebackup: Option<BaseBackupResult>,
    /// Parent backup when producing an incremental.
    pub incremental_base: Option<Backup>,

    /// Restore/archive parameters.
    pub identifier: String,
    pub position: RestorePosition,
    pub destination: Option<Utf8PathBuf>,
    pub force: bool,
    /// `annotate` payload: key and (possibly empty) value.
    pub annotation: Option<(String, String)>,

    /// Collected results for the reply.
    pub output: serde_json::Map<String, serde_json::Value>,
}

impl WorkflowContext {
    pub fn new(
        state: Arc<EngineState>,
        server: ServerConf,
        cancel: CancellationToken,
    ) -> Result<WorkflowContext> {
        let flags = state.flags_for(&server.name).ok_or_else(|| {
            Error::new(ErrorKind::ConfigInvalid, format!("unknown server {}", server.name))
        })?;
        Ok(WorkflowContext {
            state,
            server,
            flags,
            cancel,
            label: String::new(),
            backup: None,
            version: None,
            basebackup: None,
            incremental_base: None,
            identifier: String::new(),
            position: RestorePosition::Current,
            destination: None,
            force: false,
            annotation: None,
            output: serde_json::Map::new(),
        })
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.state.conf.backup_dir(&self.server.name))
    }

    pub fn entry_dir(&self) -> Utf8PathBuf {
        self.catalog().entry_dir(&self.label)
    }

    pub fn data_dir(&self) -> Utf8PathBuf {
        self.catalog().data_dir(&self.label)
    }

    pub fn workers(&self) -> usize {
        self.state.conf.workers_for(&self.server)
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::new(ErrorKind::Cancelled, "operation cancelled"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn setup(&self, _ctx: &mut WorkflowContext) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut WorkflowContext) -> Result<()>;

    async fn teardown(&self, _ctx: &mut WorkflowContext) -> Result<()> {
        Ok(())
    }
}

/// Compose the stage chain for an operation.
pub fn compose(operation: &Operation, state: &EngineState) -> Vec<Box<dyn Stage>> {
    let conf = &state.conf;
    match operation {
        Operation::Backup { .. } | Operation::IncrementalBackup { .. } => {
            let incremental = matches!(operation, Operation::IncrementalBackup { .. });
            let mut chain: Vec<Box<dyn Stage>> = vec![
                Box::new(backup::BasebackupStage { incremental }),
                Box::new(backup::ManifestStage),
                Box::new(backup::ExtraStage),
                Box::new(backup::LocalStoreStage),
            ];
            if incremental {
                chain.push(Box::new(backup::SummaryStage));
            } else {
                chain.push(Box::new(backup::HotStandbyStage));
            }
            chain.push(Box::new(backup::CompressStage));
            chain.push(Box::new(backup::EncryptStage));
            chain.push(Box::new(backup::Sha512Stage));
            chain.push(Box::new(backup::LinkStage));
            chain.push(Box::new(backup::PermissionsStage));
            if conf.remote.is_some() {
                chain.push(Box::new(backup::RemoteStage));
            }
            chain
        }
        Operation::Restore { .. } => vec![
            Box::new(restore::ResolveStage),
            Box::new(restore::RestoreCoreStage),
            Box::new(restore::RecoveryInfoStage),
            Box::new(restore::RestorePermissionsStage),
            Box::new(restore::CleanupStage),
        ],
        Operation::Archive { .. } => vec![
            Box::new(restore::ResolveStage),
            Box::new(maintenance::ArchiveStage),
        ],
        Operation::Delete { .. } => vec![Box::new(maintenance::DeleteStage)],
        Operation::Retention { .. } => vec![Box::new(maintenance::RetentionStage)],
        Operation::Verify { .. } => vec![
            Box::new(restore::ResolveStage),
            Box::new(maintenance::VerifyStage),
        ],
        Operation::Annotate { .. } => vec![Box::new(maintenance::AnnotateStage)],
        Operation::List { .. } => vec![Box::new(maintenance::ListStage)],
    }
}

/// Drive one chain: setups and executes in order, teardowns in reverse
/// for every stage whose setup completed.
pub async fn run_chain(
    stages: &[Box<dyn Stage>],
    ctx: &mut WorkflowContext,
) -> std::result::Result<(), StageError> {
    let mut set_up = 0usize;
    let mut failure: Option<StageError> = None;

    for stage in stages {
        if let Err(error) = ctx.check_cancelled() {
            failure = Some(StageError {
                stage: stage.name(),
                error,
            });
            break;
        }
        info!("stage {} (setup)", stage.name());
        if let Err(error) = stage.setup(ctx).await {
            failure = Some(StageError {
                stage: stage.name(),
                error,
            });
            break;
        }
        set_up += 1;
        info!("stage {} (execute)", stage.name());
        if let Err(error) = stage.execute(ctx).await {
            failure = Some(StageError {
                stage: stage.name(),
                error,
            });
            break;
        }
    }

    for stage in stages[..set_up].iter().rev() {
        if let Err(e) = stage.teardown(ctx).await {
            warn!("stage {} teardown failed: {e}", stage.name());
        }
    }

    match failure {
        Some(failure) => {
            error!("workflow failed in stage {}: {}", failure.stage, failure.error);
            Err(failure)
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn test_context() -> WorkflowContext {
        let conf = crate::conf::EngineConf {
            base_dir: Utf8PathBuf::from("/tmp/pgvault-test"),
            servers: vec![test_server()],
            compression: crate::conf::CompressionMethod::None,
            compression_level: 0,
            encryption: crate::conf::EncryptionMethod::None,
            master_key: None,
            workers: 1,
            retention: Default::default(),
            network_rate_limit: None,
            disk_rate_limit: None,
            compression_rate_limit: None,
            authentication_timeout: std::time::Duration::from_secs(5),
            blocking_timeout: std::time::Duration::from_secs(5),
            remote: None,
        };
        let state = EngineState::new(conf);
        WorkflowContext::new(state, test_server(), CancellationToken::new()).unwrap()
    }

    fn test_server() -> ServerConf {
        ServerConf {
            name: "primary".to_string(),
            host: "localhost".to_string(),
            port: 5432,
            user: "repl".to_string(),
            password: None,
            wal_slot: "pgvault".to_string(),
            retention: Default::default(),
            workers: None,
            hot_standby: false,
            tls: false,
        }
    }

    struct RecordingStage {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_execute: bool,
        fail_setup: bool,
    }

    #[async_trait]
    impl Stage for RecordingStage {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn setup(&self, _ctx: &mut WorkflowContext) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:setup", self.name));
            if self.fail_setup {
                return Err(Error::new(ErrorKind::Internal, "setup failed"));
            }
            Ok(())
        }

        async fn execute(&self, _ctx: &mut WorkflowContext) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:execute", self.name));
            if self.fail_execute {
                return Err(Error::new(ErrorKind::DiskIo, "execute failed"));
            }
            Ok(())
        }

        async fn teardown(&self, _ctx: &mut WorkflowContext) -> Result<()> {
            self.log.lock().unwrap().push(format!("{}:teardown", self.name));
            Ok(())
        }
    }

    fn stage(
        name: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail_setup: bool,
        fail_execute: bool,
    ) -> Box<dyn Stage> {
        Box::new(RecordingStage {
            name,
            log: log.clone(),
            fail_execute,
            fail_setup,
        })
    }

    #[tokio::test]
    async fn teardown_runs_in_reverse_on_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            stage("one", &log, false, false),
            stage("two", &log, false, false),
        ];
        let mut ctx = test_context();
        run_chain(&stages, &mut ctx).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "one:setup",
                "one:execute",
                "two:setup",
                "two:execute",
                "two:teardown",
                "one:teardown",
            ]
        );
    }

    #[tokio::test]
    async fn failed_execute_still_tears_down_completed_setups() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            stage("one", &log, false, false),
            stage("two", &log, false, true),
            stage("three", &log, false, false),
        ];
        let mut ctx = test_context();
        let err = run_chain(&stages, &mut ctx).await.unwrap_err();
        assert_eq!(err.stage, "two");
        assert_eq!(err.kind(), ErrorKind::DiskIo);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "one:setup",
                "one:execute",
                "two:setup",
                "two:execute",
                "two:teardown",
                "one:teardown",
            ]
        );
    }

    #[tokio::test]
    async fn failed_setup_does_not_teardown_that_stage() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages = vec![
            stage("one", &log, false, false),
            stage("two", &log, true, false),
        ];
        let mut ctx = test_context();
        let err = run_chain(&stages, &mut ctx).await.unwrap_err();
        assert_eq!(err.stage, "two");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["one:setup", "one:execute", "two:setup", "one:teardown"]
        );
    }

    #[test]
    fn operation_json_shape() {
        let op: Operation = serde_json::from_str(
            r#"{"operation":"delete","server":"primary","identifier":"20240101000000","force":true}"#,
        )
        .unwrap();
        assert_eq!(
            op,
            Operation::Delete {
                server: "primary".to_string(),
                identifier: "20240101000000".to_string(),
                force: true,
            }
        );
        assert_eq!(op.name(), "delete");
    }
}
