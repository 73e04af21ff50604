const DATA: &str = include_str!("args_test.in");

use crate::args::{parse_device_bench_args, ParseResult};

#[test]
fn test_example_sets() {
    let mut success_count = 0;
    let mut failure_count = 0;

    for (i, s) in DATA.lines().enumerate() {
        let s = s.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let args = std::iter::once("device-bench").chain(s.split_ascii_whitespace());
        match parse_device_bench_args(args, false) {
            Some(ParseResult::Config(_))
            | Some(ParseResult::VersionDisplayed)
            | Some(ParseResult::HelpDisplayed)
            | Some(ParseResult::NoModeSelected) => success_count += 1,
            None => {
                eprintln!("  line {}: {}", i + 1, s);
                failure_count += 1;
            }
        }
    }

    println!("Successes: {success_count}, failures: {failure_count}");
    assert_eq!(failure_count, 0);
}
