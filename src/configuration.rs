use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

/// Defines the configuration of a write run.
pub struct Configuration {
    /// The maximum duration of the run.
    ///
    /// The run may finish earlier if the operation count is exhausted or
    /// an operation fails, but it will be stopped once `max_duration` elapses.
    ///
    /// If `None`, the duration is unlimited.
    pub max_duration: Option<Duration>,

    /// The maximum number of operations to issue. `None` means no limit.
    pub max_operations: Option<u64>,

    /// The maximum number of operations in flight at the same time.
    ///
    /// Every operation runs on its own tokio task which holds one slot
    /// of a pool of this size for its whole lifetime.
    ///
    /// Must not be zero.
    pub concurrency: u64,

    /// The maximum number of operations to be started per second.
    /// If `None`, then there is no rate limit imposed.
    pub rate_limit_per_second: Option<f64>,

    /// How many failed operations are tolerated before the run fails.
    /// With zero, the first failure stops the run.
    pub max_errors: u64,

    /// The operation repeatedly performed during the run.
    pub operation: Arc<dyn Operation>,
}

/// Contains all necessary context needed to execute an Operation.
pub struct OperationContext {
    /// The ID of the operation being performed.
    ///
    /// IDs are issued sequentially, but operations run concurrently
    /// so they may complete in any order.
    pub operation_id: u64,

    /// The time at which the rate limiter allowed the operation to start.
    /// Equal to `actual_start_time` when there is no rate limit.
    pub scheduled_start_time: Instant,

    /// The time at which the operation actually started.
    pub actual_start_time: Instant,
}

/// Represents an operation which is repeatedly performed during the run.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Executes the operation, given information in the OperationContext.
    ///
    /// Returns ControlFlow::Break if the whole run should finish, for
    /// example when the workload has nothing more to produce.
    /// In other cases, it returns ControlFlow::Continue.
    async fn execute(&self, ctx: &OperationContext) -> Result<ControlFlow<()>>;
}

/// The storage location a run works against.
///
/// Built once at startup from validated names and passed by value
/// into every component that talks to the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreTarget {
    pub project: String,
    pub instance: String,
    pub table: String,
    pub column_family: String,
}

/// Name of the table the CQL backend keeps its column family registry in.
pub const RESERVED_TABLE_NAME: &str = "column_families";

impl StoreTarget {
    pub fn new(
        project: impl Into<String>,
        instance: impl Into<String>,
        table: impl Into<String>,
        column_family: impl Into<String>,
    ) -> Result<Self> {
        let target = Self {
            project: project.into(),
            instance: instance.into(),
            table: table.into(),
            column_family: column_family.into(),
        };
        target.validate()?;
        Ok(target)
    }

    fn validate(&self) -> Result<()> {
        lazy_static! {
            static ref TABLE_NAME: regex::Regex =
                regex::Regex::new(r"^[a-z][a-z0-9_]{0,47}$").unwrap();
            static ref FAMILY_NAME: regex::Regex =
                regex::Regex::new(r"^[_A-Za-z0-9][-_.A-Za-z0-9]*$").unwrap();
        }

        anyhow::ensure!(!self.project.is_empty(), "project must not be empty");
        anyhow::ensure!(!self.instance.is_empty(), "instance must not be empty");
        anyhow::ensure!(
            TABLE_NAME.is_match(&self.table),
            "Invalid table name {:?}; must match pattern {}",
            self.table,
            TABLE_NAME.as_str(),
        );
        anyhow::ensure!(
            self.table != RESERVED_TABLE_NAME,
            "Table name {} is reserved",
            RESERVED_TABLE_NAME,
        );
        anyhow::ensure!(
            FAMILY_NAME.is_match(&self.column_family),
            "Invalid column family name {:?}; must match pattern {}",
            self.column_family,
            FAMILY_NAME.as_str(),
        );
        Ok(())
    }
}
