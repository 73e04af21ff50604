use std::ops::ControlFlow;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error};

use device_bench::configuration::{Operation, OperationContext, StoreTarget};
use device_bench::gateway::{Mutation, StorageGateway};
use device_bench::payload::{PayloadKind, RngGen};
use device_bench::row_key::{next_row_key, now_micros, now_nanos};

use crate::stats::ShardedStats;

// Base device ids are drawn from this range
const DEVICE_ID_RANGE: std::ops::Range<u64> = 0..1_000_000;

pub(crate) struct WriteConfig {
    pub qualifiers: Vec<String>,
    pub payload: PayloadKind,
    pub devices: u64,
}

/// Writes one row of synthetic readings per execution.
///
/// Write number `i` of the run goes to device `base + i mod devices`, where
/// the base device is drawn once from the random source.
pub(crate) struct WriteOperation {
    gateway: Arc<dyn StorageGateway>,
    target: StoreTarget,
    stats: Arc<ShardedStats>,
    qualifiers: Vec<String>,
    payload: PayloadKind,
    devices: u64,
    device_base: u64,

    gen: Mutex<RngGen>,
}

impl WriteOperation {
    pub fn new(
        gateway: Arc<dyn StorageGateway>,
        target: StoreTarget,
        stats: Arc<ShardedStats>,
        config: WriteConfig,
        mut gen: RngGen,
    ) -> Self {
        let device_base = gen.gen_range(DEVICE_ID_RANGE);
        Self {
            gateway,
            target,
            stats,
            qualifiers: config.qualifiers,
            payload: config.payload,
            devices: config.devices.max(1),
            device_base,
            gen: Mutex::new(gen),
        }
    }

    pub fn device_base(&self) -> u64 {
        self.device_base
    }

    fn build_mutation(&self) -> Mutation {
        // All cells of a row share the timestamp
        let timestamp = now_micros();
        let mut gen = self.gen.lock();
        let mut mutation = Mutation::new();
        for qualifier in &self.qualifiers {
            let value = self.payload.generate(&mut *gen);
            mutation.set(&self.target.column_family, qualifier, timestamp, value);
        }
        mutation
    }
}

#[async_trait]
impl Operation for WriteOperation {
    async fn execute(&self, ctx: &OperationContext) -> Result<ControlFlow<()>> {
        let device_id = self.device_base + ctx.operation_id % self.devices;
        let row_key = next_row_key(device_id, now_nanos());
        let mutation = self.build_mutation();
        let cells = mutation.len();

        let start = Instant::now();
        let result = self
            .gateway
            .apply_mutation(&self.target.table, &row_key, mutation)
            .await;
        let elapsed = start.elapsed();

        match &result {
            Ok(()) => debug!(row_key = %row_key, elapsed = ?elapsed, "write successful"),
            Err(err) => error!(
                error = %err,
                row_key = %row_key,
                elapsed = ?elapsed,
                "write error",
            ),
        }

        self.stats
            .get_shard_mut()
            .account_op(ctx, &result, cells);

        result?;
        Ok(ControlFlow::Continue(()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::TryStreamExt;

    use device_bench::configuration::Configuration;
    use device_bench::gateway::memory::InMemoryGateway;
    use device_bench::gateway::{RowStream, RowView, TableInfo};
    use device_bench::payload::new_rng;
    use device_bench::run;

    use super::*;
    use crate::operation::synthetic_qualifiers;
    use crate::stats::new_sharded_stats;

    fn target() -> StoreTarget {
        StoreTarget::new("demo", "test", "readings", "stats_summary").unwrap()
    }

    fn write_op(gateway: Arc<dyn StorageGateway>, stats: Arc<ShardedStats>) -> WriteOperation {
        let config = WriteConfig {
            qualifiers: synthetic_qualifiers(3),
            payload: PayloadKind::Hex(8),
            devices: 1,
        };
        WriteOperation::new(gateway, target(), stats, config, new_rng(7))
    }

    fn config(op: WriteOperation, workers: u64) -> Configuration {
        Configuration {
            max_duration: None,
            max_operations: None,
            concurrency: workers,
            rate_limit_per_second: None,
            max_errors: 0,
            operation: Arc::new(op),
        }
    }

    // A gateway whose writes take a while and may fail on a given call.
    #[derive(Default)]
    struct FakeGateway {
        delay: Duration,
        fail_on_call: Option<usize>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
        completed: AtomicUsize,
    }

    #[async_trait]
    impl StorageGateway for FakeGateway {
        async fn list_tables(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn create_table(&self, _table: &str) -> Result<()> {
            Ok(())
        }

        async fn table_info(&self, _table: &str) -> Result<TableInfo> {
            Ok(TableInfo::default())
        }

        async fn create_column_family(&self, _table: &str, _family: &str) -> Result<()> {
            Ok(())
        }

        async fn apply_mutation(
            &self,
            _table: &str,
            _row_key: &str,
            _mutation: Mutation,
        ) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(anyhow::anyhow!("injected failure on call {call}"));
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn scan_prefix(
            &self,
            _table: &str,
            _prefix: &str,
            _limit: usize,
        ) -> Result<RowStream> {
            Err(anyhow::anyhow!("scans are not supported"))
        }
    }

    #[tokio::test]
    async fn test_bounded_workers_make_progress() {
        let gateway = Arc::new(FakeGateway {
            delay: Duration::from_millis(10),
            ..FakeGateway::default()
        });
        let stats = Arc::new(new_sharded_stats(false));
        let op = write_op(gateway.clone(), stats.clone());

        let (ctrl, fut) = run::run(config(op, 3));
        let stopper = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctrl.ask_to_stop();
        };
        let (result, ()) = tokio::join!(fut, stopper);
        result.unwrap();

        assert!(gateway.completed.load(Ordering::SeqCst) >= 2);
        assert!(gateway.peak_in_flight.load(Ordering::SeqCst) <= 3);

        let combined = stats.get_combined_and_clear();
        assert_eq!(combined.operations as usize, gateway.calls.load(Ordering::SeqCst));
        assert_eq!(combined.cells, combined.operations * 3);
        assert_eq!(combined.errors, 0);
    }

    #[tokio::test]
    async fn test_failure_stops_the_run() {
        const WORKERS: usize = 3;
        let gateway = Arc::new(FakeGateway {
            delay: Duration::from_millis(1),
            fail_on_call: Some(5),
            ..FakeGateway::default()
        });
        let stats = Arc::new(new_sharded_stats(false));
        let op = write_op(gateway.clone(), stats.clone());

        let (_ctrl, fut) = run::run(config(op, WORKERS as u64));
        let err = tokio::time::timeout(Duration::from_secs(10), fut)
            .await
            .expect("the run did not stop")
            .unwrap_err();

        assert_eq!(err.to_string(), "injected failure on call 5");
        let calls = gateway.calls.load(Ordering::SeqCst);
        assert!(calls >= 5);
        // Only the writes already holding a slot when call 5 failed may follow it
        assert!(calls <= 5 + WORKERS - 1, "{calls} writes were issued");
        assert_eq!(stats.get_combined_and_clear().errors, 1);
    }

    #[tokio::test]
    async fn test_writes_land_in_store() {
        let gateway = Arc::new(InMemoryGateway::new());
        let target = target();
        gateway.create_table(&target.table).await.unwrap();
        gateway
            .create_column_family(&target.table, &target.column_family)
            .await
            .unwrap();

        let stats = Arc::new(new_sharded_stats(true));
        let write_config = WriteConfig {
            qualifiers: synthetic_qualifiers(2),
            payload: PayloadKind::Float,
            devices: 20,
        };
        let op = WriteOperation::new(
            gateway.clone(),
            target.clone(),
            stats.clone(),
            write_config,
            new_rng(3),
        );
        let base = op.device_base();

        let mut cfg = config(op, 4);
        cfg.max_operations = Some(20);
        let (_ctrl, fut) = run::run(cfg);
        fut.await.unwrap();

        let rows: Vec<RowView> = gateway
            .scan_prefix(&target.table, "device/", 100)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 20);
        for row in &rows {
            let device: u64 = row.key.split('/').nth(1).unwrap().parse().unwrap();
            assert!((base..base + 20).contains(&device), "{}", row.key);

            let qualifiers: Vec<_> = row.cells.iter().map(|c| c.qualifier.as_str()).collect();
            assert_eq!(qualifiers, ["some_random_value_1", "some_random_value_2"]);
            assert!(row.cells.iter().all(|c| c.value.len() == 8));
            assert_eq!(row.cells[0].timestamp_micros, row.cells[1].timestamp_micros);
        }

        let combined = stats.get_combined_and_clear();
        assert_eq!(combined.operations, 20);
        assert_eq!(combined.cells, 40);
    }
}
