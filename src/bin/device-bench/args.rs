use std::io::Write;
use std::iter::Iterator;
use std::time::Duration;

use anyhow::Result;
use scylla::statement::Consistency;

use device_bench::configuration::StoreTarget;
use device_bench::payload::PayloadKind;
use device_bench::report::DEFAULT_SCAN_LIMIT;

use crate::gocompat::flags::{GoValue, HelpRequested, ParserBuilder};

pub(crate) const MAX_COLUMNS: u64 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Write,
    Read,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StoreKind {
    Cql,
    Memory,
}

impl GoValue for StoreKind {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "cql" => Ok(StoreKind::Cql),
            "memory" => Ok(StoreKind::Memory),
            _ => Err(anyhow::anyhow!("unknown store: {} (expected cql or memory)", s)),
        }
    }

    fn to_string(&self) -> String {
        match self {
            StoreKind::Cql => "cql".to_string(),
            StoreKind::Memory => "memory".to_string(),
        }
    }
}

impl GoValue for PayloadKind {
    fn parse(s: &str) -> Result<Self> {
        s.parse()
    }

    fn to_string(&self) -> String {
        format!("{self}")
    }
}

// Explicitly marked as `pub(crate)`, because with `pub` rustc doesn't
// complain about fields which are never read
pub(crate) struct DeviceBenchArgs {
    pub target: StoreTarget,
    pub mode: Mode,
    pub store: StoreKind,

    // Cluster access, used by the cql store only
    pub nodes: Vec<String>,
    pub replication_factor: i64,
    pub consistency_level: Consistency,
    pub timeout: Duration,

    // Write mode
    pub workers: u64,
    pub duration: Duration,
    pub operations: u64,
    pub max_rate: u64,
    pub max_errors: u64,
    pub columns: u64,
    pub payload: PayloadKind,
    pub devices: u64,
    pub seed: u64,
    pub measure_latency: bool,

    // Read mode
    pub prefix: String,
    pub limit: u64,
}

pub(crate) enum ParseResult {
    Config(Box<DeviceBenchArgs>),
    VersionDisplayed,
    HelpDisplayed,
    NoModeSelected,
}

pub(crate) const USAGE_HINT: &str =
    "Nothing to do: pass -write to generate device readings or -read to scan them back \
    (run with -help to list all flags)";

// Parses and validates device-bench flags. Returns `None` if the flags
// are wrong, after printing the problem and the usage when `print_errors`.
pub(crate) fn parse_device_bench_args<I, S>(mut args: I, print_errors: bool) -> Option<ParseResult>
where
    I: Iterator<Item = S>,
    S: AsRef<str>,
{
    let program_name = args
        .next()
        .map(|name| name.as_ref().to_string())
        .unwrap_or_else(|| "device-bench".to_string());

    let mut flag = ParserBuilder::new();

    let project = flag.string_var("project", "demo", "`project` owning the instance");
    let instance = flag.string_var("instance", "my-instance-id", "storage `instance` to use");
    let table = flag.string_var("table", "mobile_time_series", "`table` to write to and read from");
    let column_family = flag.string_var(
        "column-family",
        "stats_summary",
        "`family` of the synthetic columns",
    );

    let write = flag.bool_var("write", false, "write synthetic device readings");
    let read = flag.bool_var("read", false, "read rows back by key prefix");

    let store = flag.var(
        "store",
        StoreKind::Cql,
        "storage backend: cql, or memory for a local dry run",
    );
    let nodes = flag.string_var("nodes", "127.0.0.1:9042", "cluster contact nodes");
    let replication_factor = flag.u64_var("replication-factor", 1, "replication factor");
    let consistency_level = flag.string_var("consistency-level", "quorum", "consistency level");
    let timeout = flag.duration_var("timeout", Duration::from_secs(5), "request timeout");

    let workers = flag.u64_var("workers", 10, "maximum number of writes in flight");
    let duration = flag.duration_var(
        "duration",
        Duration::ZERO,
        "duration of the write run (0 for unlimited)",
    );
    let operations = flag.u64_var(
        "operations",
        0,
        "number of rows to write (0 for unlimited)",
    );
    let max_rate = flag.u64_var(
        "max-rate",
        0,
        "the maximum rate of writes in op/s (0 for unlimited)",
    );
    let max_errors = flag.u64_var(
        "max-errors",
        0,
        "number of failed writes to tolerate before stopping",
    );
    let columns = flag.u64_var("columns", 3, "number of synthetic columns per row, 1 to 6");
    let payload = flag.var(
        "payload",
        PayloadKind::Float,
        "column value: float (8 bytes) or hex:N (N random hex digits)",
    );
    let devices = flag.u64_var("devices", 1, "number of simulated devices");
    let seed = flag.u64_var("seed", 0, "seed of the random source (0 to seed from entropy)");
    let measure_latency = flag.bool_var("measure-latency", true, "measure request latency");

    let prefix = flag.string_var("prefix", "device", "read rows whose key starts with `prefix`");
    let limit = flag.u64_var(
        "limit",
        DEFAULT_SCAN_LIMIT as u64,
        "maximum number of rows to read",
    );

    let version = flag.bool_var("version", false, "display version and exit");

    let (parser, desc) = flag.build();

    let result = move || -> Result<ParseResult> {
        parser.parse_args(args)?;

        if version.get() {
            println!("{}", device_bench::version::format_version_info_human());
            return Ok(ParseResult::VersionDisplayed);
        }

        let mode = match (write.get(), read.get()) {
            (true, true) => anyhow::bail!("-write and -read are mutually exclusive"),
            (true, false) => Mode::Write,
            (false, true) => Mode::Read,
            (false, false) => return Ok(ParseResult::NoModeSelected),
        };

        let target = StoreTarget::new(
            project.get(),
            instance.get(),
            table.get(),
            column_family.get(),
        )?;

        let nodes: Vec<String> = nodes
            .get()
            .split(',')
            .map(str::trim)
            .filter(|node| !node.is_empty())
            .map(str::to_string)
            .collect();
        anyhow::ensure!(!nodes.is_empty(), "at least one contact node is required");

        let replication_factor = replication_factor.get();
        anyhow::ensure!(
            replication_factor > 0,
            "replication factor must be positive"
        );
        let replication_factor = i64::try_from(replication_factor)?;

        let workers = workers.get();
        anyhow::ensure!(workers > 0, "the number of workers must be positive");

        let columns = columns.get();
        anyhow::ensure!(
            (1..=MAX_COLUMNS).contains(&columns),
            "the number of columns must be between 1 and {}, got {}",
            MAX_COLUMNS,
            columns,
        );

        let devices = devices.get();
        anyhow::ensure!(devices > 0, "the number of devices must be positive");

        Ok(ParseResult::Config(Box::new(DeviceBenchArgs {
            target,
            mode,
            store: store.get(),
            nodes,
            replication_factor,
            consistency_level: parse_consistency_level(&consistency_level.get())?,
            timeout: timeout.get(),
            workers,
            duration: duration.get(),
            operations: operations.get(),
            max_rate: max_rate.get(),
            max_errors: max_errors.get(),
            columns,
            payload: payload.get(),
            devices,
            seed: seed.get(),
            measure_latency: measure_latency.get(),
            prefix: prefix.get(),
            limit: limit.get(),
        })))
    }();

    match result {
        Ok(result) => Some(result),
        Err(err) if err.is::<HelpRequested>() => {
            if print_errors {
                let _ = desc.print_help(&mut std::io::stdout(), &program_name);
            }
            Some(ParseResult::HelpDisplayed)
        }
        Err(err) => {
            if print_errors {
                let mut out = std::io::stderr();
                let _ = writeln!(out, "Failed to parse flags: {err}");
                let _ = desc.print_help(&mut out, &program_name);
            }
            None
        }
    }
}

fn parse_consistency_level(s: &str) -> Result<Consistency> {
    let level = match s {
        "any" => Consistency::Any,
        "one" => Consistency::One,
        "two" => Consistency::Two,
        "three" => Consistency::Three,
        "quorum" => Consistency::Quorum,
        "all" => Consistency::All,
        "local_quorum" => Consistency::LocalQuorum,
        "each_quorum" => Consistency::EachQuorum,
        "local_one" => Consistency::LocalOne,
        _ => return Err(anyhow::anyhow!("Unknown consistency level: {}", s)),
    };
    Ok(level)
}

impl DeviceBenchArgs {
    pub fn print_configuration(&self) {
        let t = &self.target;
        println!("Project:\t\t{}", t.project);
        println!("Instance:\t\t{}", t.instance);
        println!("Table:\t\t\t{}", t.table);
        println!("Column family:\t\t{}", t.column_family);
        match self.store {
            StoreKind::Cql => {
                println!("Nodes:\t\t\t{}", self.nodes.join(","));
                println!("Consistency level:\t{:?}", self.consistency_level);
                println!("Timeout:\t\t{}", GoValue::to_string(&self.timeout));
            }
            StoreKind::Memory => println!("Store:\t\t\tmemory"),
        }

        match self.mode {
            Mode::Write => {
                println!("Mode:\t\t\twrite");
                println!("Workers:\t\t{}", self.workers);
                println!("Devices:\t\t{}", self.devices);
                println!("Columns per row:\t{}", self.columns);
                println!("Payload:\t\t{}", self.payload);
                if self.duration.is_zero() {
                    println!("Duration:\t\tunlimited");
                } else {
                    println!("Duration:\t\t{}", GoValue::to_string(&self.duration));
                }
                if self.operations == 0 {
                    println!("Operations:\t\tunlimited");
                } else {
                    println!("Operations:\t\t{}", self.operations);
                }
                if self.max_rate == 0 {
                    println!("Maximum rate:\t\tunlimited");
                } else {
                    println!("Maximum rate:\t\t{} op/s", self.max_rate);
                }
                println!("Tolerated errors:\t{}", self.max_errors);
            }
            Mode::Read => {
                println!("Mode:\t\t\tread");
                println!("Prefix:\t\t\t{:?}", self.prefix);
                println!("Limit:\t\t\t{}", self.limit);
            }
        }
        println!();
    }
}
