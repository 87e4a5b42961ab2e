//! Policy validation CLI tool
//!
//! Loads a directory of *.pol files and reports any problems.

use std::path::PathBuf;
use std::process::ExitCode;
use warden_config::{ConfigError, DirectoryPolicies, PolicySource, validate_policies};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let dir = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("Usage: validate-policies <policy-dir>");
            eprintln!();
            eprintln!("Validates every *.pol file in a warden policy directory.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-policies /etc/warden/policies");
            return ExitCode::from(2);
        }
    };

    if !dir.is_dir() {
        eprintln!("Error: Policy directory not found: {}", dir.display());
        return ExitCode::from(1);
    }

    let policies = match DirectoryPolicies::new(&dir).policies() {
        Ok(policies) => policies,
        Err(e) => {
            eprintln!("✗ Policy loading failed");
            eprintln!();
            match &e {
                ConfigError::PolicyDecode { path, source } => {
                    eprintln!("JSON error in {}:", path.display());
                    eprintln!("  {}", source);
                }
                other => eprintln!("{}", other),
            }
            return ExitCode::from(1);
        }
    };

    let errors = validate_policies(&policies);
    if !errors.is_empty() {
        eprintln!("✗ Policy validation failed");
        eprintln!();
        eprintln!("Validation errors ({}):", errors.len());
        for err in &errors {
            eprintln!("  - {}", err);
        }
        return ExitCode::from(1);
    }

    println!("✓ Policies are valid");
    println!();
    println!("Summary:");
    println!("  Policies: {}", policies.len());
    println!("  Resources: {}", policies.resources().len());

    if !policies.is_empty() {
        println!();
        println!("Policies:");
        for policy in &policies {
            println!("  - {} {}", policy.hash(), policy);
        }
    }

    ExitCode::SUCCESS
}
