//! Shared fixtures for unit tests: POSIX `sh` language profiles, so process
//! tests do not depend on any compiler being installed.

use std::path::Path;

use crate::core::languages::LanguageRegistry;
use crate::engine::compiler::Artifact;

const TEST_LANGUAGES: &str = r#"
[sh]
source_file = "main.sh"
run_command = "sh {artifact}"

[sh-unbounded]
source_file = "main.sh"
run_command = "sh {artifact}"
limit_address_space = false

[shc]
source_file = "main.sh"
compile_command = ["sh", "-c", "sh -n \"$0\" && cp \"$0\" \"$1\"", "{source}", "{artifact}"]
artifact = "binary"
artifact_name = "prog"
artifact_suffix = ".sh"
run_command = "sh {artifact}"

[slowc]
source_file = "main.sh"
compile_command = ["sh", "-c", "sleep 5"]
artifact_name = "prog"
run_command = "sh {artifact}"

[noartifact]
source_file = "main.sh"
compile_command = "true"
run_command = "sh {artifact}"

[missing]
source_file = "main.sh"
run_command = "/nonexistent/interpreter {artifact}"
"#;

pub fn test_registry() -> LanguageRegistry {
    LanguageRegistry::from_toml_str(TEST_LANGUAGES).unwrap()
}

/// Write `script` as an interpreted artifact in `dir`
pub fn sh_artifact(dir: &Path, script: &str) -> Artifact {
    std::fs::write(dir.join("main.sh"), script).unwrap();
    Artifact::new(dir, "main.sh")
}
