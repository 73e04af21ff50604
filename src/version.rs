#[derive(Debug)]
pub struct VersionInfo {
    pub device_bench_version: &'static str,
    pub device_bench_build_date: &'static str,
    pub scylla_driver_version: &'static str,
}

mod version_info {
    include!(concat!(env!("OUT_DIR"), "/version_info.rs"));
}

pub fn get_version_info() -> VersionInfo {
    VersionInfo {
        device_bench_version: version_info::PKG_VERSION,
        device_bench_build_date: version_info::BUILD_DATE,
        scylla_driver_version: version_info::SCYLLA_VERSION,
    }
}

pub fn format_version_info_human() -> String {
    let info = get_version_info();
    format!(
        "device-bench:\n\
         - Version: {}\n\
         - Build Date: {}\n\
         scylla-driver:\n\
         - Version: {}",
        info.device_bench_version, info.device_bench_build_date, info.scylla_driver_version,
    )
}
