//! Build script for weft-runtime
//!
//! Generates `OUT_DIR/weft_merged_config.rs` with the compile-time defaults
//! used by `config::defaults`. If `WEFT_CONFIG_RS` points at a file of
//! `pub const NAME: TYPE = VALUE;` lines, its values replace the library
//! defaults; unknown names are reported as build warnings.

use std::env;
use std::fs;
use std::path::Path;

struct ConfigParam {
    name: &'static str,
    rust_type: &'static str,
    default_value: &'static str,
}

const CONFIG_PARAMS: &[ConfigParam] = &[
    ConfigParam {
        name: "STACK_SIZE",
        rust_type: "usize",
        default_value: "256 * 1024",
    },
    ConfigParam {
        name: "MAX_EVENTS",
        rust_type: "usize",
        default_value: "1024",
    },
    ConfigParam {
        name: "TIMER_BATCH",
        rust_type: "usize",
        default_value: "1024",
    },
    ConfigParam {
        name: "ASYNC_WORKERS",
        rust_type: "usize",
        default_value: "4",
    },
    ConfigParam {
        name: "WATCHER_CHUNK",
        rust_type: "usize",
        default_value: "64",
    },
    ConfigParam {
        name: "STACK_CACHE",
        rust_type: "usize",
        default_value: "16",
    },
    ConfigParam {
        name: "DEBUG_LOGGING",
        rust_type: "bool",
        default_value: "false",
    },
];

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("weft_merged_config.rs");

    let mut values: Vec<String> = CONFIG_PARAMS
        .iter()
        .map(|p| p.default_value.to_string())
        .collect();

    let user_path = env::var("WEFT_CONFIG_RS").ok();
    if let Some(path) = &user_path {
        println!("cargo:rerun-if-changed={}", path);
        match fs::read_to_string(path) {
            Ok(content) => {
                for (name, value) in parse_consts(&content) {
                    match CONFIG_PARAMS.iter().position(|p| p.name == name) {
                        Some(i) => values[i] = value,
                        None => println!("cargo:warning=Unknown weft config parameter: {}", name),
                    }
                }
                println!("cargo:warning=Using custom weft config: {}", path);
            }
            Err(e) => {
                println!("cargo:warning=Failed to read WEFT_CONFIG_RS ({}): {}", path, e);
            }
        }
    }
    println!("cargo:rerun-if-env-changed=WEFT_CONFIG_RS");

    let mut output = String::from("// Generated by weft-runtime/build.rs\n");
    if let Some(path) = &user_path {
        output.push_str(&format!("// Overrides from {}\n", path));
    }
    output.push('\n');
    for (param, value) in CONFIG_PARAMS.iter().zip(&values) {
        output.push_str(&format!(
            "pub const {}: {} = {};\n",
            param.name, param.rust_type, value
        ));
    }

    fs::write(&dest_path, output).expect("Failed to write merged config");
}

/// Collect `(NAME, VALUE)` from every `pub const NAME: TYPE = VALUE;` line
fn parse_consts(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.starts_with("//"))
        .filter_map(parse_const_line)
        .collect()
}

fn parse_const_line(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix("pub const ")?.trim();
    let (name, rest) = rest.split_once(':')?;
    let (_, value) = rest.split_once('=')?;
    let value = value.trim().trim_end_matches(';').trim();
    Some((name.trim().to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_const_line() {
        assert_eq!(
            parse_const_line("pub const ASYNC_WORKERS: usize = 8;"),
            Some(("ASYNC_WORKERS".into(), "8".into()))
        );
        assert_eq!(
            parse_const_line("pub const STACK_SIZE: usize = 512 * 1024;"),
            Some(("STACK_SIZE".into(), "512 * 1024".into()))
        );
        assert_eq!(parse_const_line("const X: u8 = 1;"), None);
    }

    #[test]
    fn test_parse_consts_skips_comments() {
        let got = parse_consts(
            r#"
            // pub const MAX_EVENTS: usize = 1;
            pub const MAX_EVENTS: usize = 256;
            pub const DEBUG_LOGGING: bool = true;
            "#,
        );
        assert_eq!(
            got,
            vec![
                ("MAX_EVENTS".to_string(), "256".to_string()),
                ("DEBUG_LOGGING".to_string(), "true".to_string()),
            ]
        );
    }
}
