//! Language profiles for compilation and execution
//!
//! A profile is loaded once from TOML and never mutated. The built-in table is
//! embedded at compile time; operators can replace it with their own file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

const BUILTIN_LANGUAGES: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

#[derive(Debug, Error)]
pub enum LanguageError {
    #[error("unsupported language: {0}")]
    Unknown(String),
    #[error("invalid profile for {language}: {reason}")]
    Invalid { language: String, reason: String },
    #[error("failed to parse language table: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read language table {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the compiler stage leaves behind for the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Interpreted: the source file itself is run
    Source,
    /// A single file `<out_dir>/<name><suffix>`
    Binary { name: String, suffix: String },
    /// A class directory (`<out_dir>`), entry point named after the source stem
    ClassDir,
}

/// Static description of a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    /// Primary language id (lowercase)
    pub id: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command template (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command template
    pub run_command: Vec<String>,
    pub artifact: ArtifactKind,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
    /// Whether RLIMIT_AS may be applied. Runtimes that reserve large virtual
    /// ranges up front (JVM, V8) fail to start under an address-space ceiling.
    pub limit_address_space: bool,
    /// Extra environment variables for compile and run
    pub env: Vec<(String, String)>,
}

impl LanguageProfile {
    pub fn needs_compilation(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Extension of the source file including the dot (e.g. ".cpp")
    pub fn source_extension(&self) -> Option<&str> {
        self.source_file
            .rfind('.')
            .map(|idx| &self.source_file[idx..])
    }

    /// Source file stem, used as the entry class for class-dir artifacts
    pub fn main_class(&self) -> &str {
        self.source_file
            .rfind('.')
            .map(|idx| &self.source_file[..idx])
            .unwrap_or(&self.source_file)
    }

    /// Suffix of the compiled artifact, empty for interpreted languages
    pub fn compiled_artifact_suffix(&self) -> &str {
        match &self.artifact {
            ArtifactKind::Binary { suffix, .. } => suffix,
            ArtifactKind::ClassDir => ".class",
            ArtifactKind::Source => "",
        }
    }

    /// Path of the artifact relative to the build directory.
    /// Computed from the profile alone; the directory is never scanned.
    pub fn artifact_relative_path(&self) -> PathBuf {
        match &self.artifact {
            ArtifactKind::Source => PathBuf::from(&self.source_file),
            ArtifactKind::Binary { name, suffix } => PathBuf::from(format!("{}{}", name, suffix)),
            ArtifactKind::ClassDir => PathBuf::from(format!("{}.class", self.main_class())),
        }
    }

    /// Build the compiler argv for a source written into `out_dir`
    pub fn build_compile_command(&self, source: &Path, out_dir: &Path) -> Option<Vec<String>> {
        let template = self.compile_command.as_ref()?;
        let artifact = out_dir.join(self.artifact_relative_path());
        Some(render(
            template,
            &[
                ("{source}", path_str(source)),
                ("{out_dir}", path_str(out_dir)),
                ("{artifact}", path_str(&artifact)),
                ("{artifact_dir}", path_str(out_dir)),
                ("{main_class}", self.main_class().to_string()),
            ],
        ))
    }

    /// Build the run argv for an artifact located at `artifact` inside `artifact_dir`
    pub fn build_run_command(&self, artifact: &Path, artifact_dir: &Path) -> Vec<String> {
        render(
            &self.run_command,
            &[
                ("{source}", path_str(artifact)),
                ("{out_dir}", path_str(artifact_dir)),
                ("{artifact}", path_str(artifact)),
                ("{artifact_dir}", path_str(artifact_dir)),
                ("{main_class}", self.main_class().to_string()),
            ],
        )
    }

    /// Calculate actual time limit based on base time limit
    /// base_time_ms: base time limit in milliseconds (from problem)
    /// Returns: adjusted time limit in milliseconds
    pub fn calculate_time_limit(&self, base_time_ms: u32) -> u32 {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => base_time_ms
                .saturating_mul(multiplier)
                .saturating_add(bonus_seconds.saturating_mul(1000)),
            None => base_time_ms,
        }
    }

    /// Calculate actual memory limit based on base memory limit, both in KB
    pub fn calculate_memory_limit_kb(&self, base_memory_kb: u64) -> u64 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => base_memory_kb
                .saturating_mul(multiplier as u64)
                .saturating_add(bonus_mb as u64 * 1024),
            None => base_memory_kb,
        }
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Substitute placeholders per argument. Arguments are never re-split, so
/// paths with spaces stay a single argv entry.
fn render(template: &[String], vars: &[(&str, String)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect()
}

/// Command as written in TOML: a whitespace-split line or an explicit argv
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Line(String),
    Argv(Vec<String>),
}

impl RawCommand {
    fn into_command(self) -> Vec<String> {
        match self {
            RawCommand::Line(line) => line.split_whitespace().map(|s| s.to_string()).collect(),
            RawCommand::Argv(argv) => argv,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum RawArtifactKind {
    Source,
    Binary,
    ClassDir,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageProfile {
    source_file: String,
    compile_command: Option<RawCommand>,
    run_command: RawCommand,
    artifact: Option<RawArtifactKind>,
    artifact_name: Option<String>,
    #[serde(default)]
    artifact_suffix: String,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default = "default_limit_address_space")]
    limit_address_space: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    aliases: Vec<String>,
}

fn default_limit_address_space() -> bool {
    true
}

impl RawLanguageProfile {
    fn into_profile(self, id: &str) -> Result<LanguageProfile, LanguageError> {
        let invalid = |reason: String| LanguageError::Invalid {
            language: id.to_string(),
            reason,
        };

        let parse_limit = |raw_limit: &[String], kind: &str| -> Result<Option<(u32, u32)>, LanguageError> {
            if raw_limit.is_empty() {
                return Ok(None);
            }
            if raw_limit.len() != 2 {
                return Err(invalid(format!("{} limit must be [multiplier, bonus]: {:?}", kind, raw_limit)));
            }
            let multiplier = raw_limit[0]
                .parse::<u32>()
                .map_err(|_| invalid(format!("invalid {} multiplier: {}", kind, raw_limit[0])))?;
            let bonus = raw_limit[1]
                .parse::<u32>()
                .map_err(|_| invalid(format!("invalid {} bonus: {}", kind, raw_limit[1])))?;
            Ok(Some((multiplier, bonus)))
        };

        if self.source_file.is_empty()
            || self.source_file.contains('/')
            || self.source_file.contains('\\')
        {
            return Err(invalid(format!(
                "source_file must be a plain file name: {:?}",
                self.source_file
            )));
        }

        let compile_command = self.compile_command.map(RawCommand::into_command);
        if matches!(&compile_command, Some(cmd) if cmd.is_empty()) {
            return Err(invalid("empty compile_command".into()));
        }
        let run_command = self.run_command.into_command();
        if run_command.is_empty() {
            return Err(invalid("empty run_command".into()));
        }

        let kind = self.artifact.unwrap_or(if compile_command.is_some() {
            RawArtifactKind::Binary
        } else {
            RawArtifactKind::Source
        });
        let artifact = match kind {
            RawArtifactKind::Source => ArtifactKind::Source,
            RawArtifactKind::Binary => ArtifactKind::Binary {
                name: self.artifact_name.unwrap_or_else(|| "main".to_string()),
                suffix: self.artifact_suffix,
            },
            RawArtifactKind::ClassDir => ArtifactKind::ClassDir,
        };
        if artifact != ArtifactKind::Source && compile_command.is_none() {
            return Err(invalid("compiled artifact requires a compile_command".into()));
        }

        Ok(LanguageProfile {
            id: id.to_string(),
            source_file: self.source_file,
            compile_command,
            run_command,
            artifact,
            time_limit: parse_limit(&self.time_limit, "time")?,
            memory_limit: parse_limit(&self.memory_limit, "memory")?,
            limit_address_space: self.limit_address_space,
            env: self.env.into_iter().collect(),
        })
    }
}

/// Lookup table from language id (or alias) to profile
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    profiles: HashMap<String, Arc<LanguageProfile>>,
    primary: Vec<String>,
}

impl LanguageRegistry {
    /// Registry built from the embedded language table
    pub fn builtin() -> Result<Self, LanguageError> {
        Self::from_toml_str(BUILTIN_LANGUAGES)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LanguageError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| LanguageError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, LanguageError> {
        let raw_profiles: BTreeMap<String, RawLanguageProfile> = toml::from_str(content)?;

        let mut registry = Self::default();
        for (name, mut raw) in raw_profiles {
            let id = name.to_lowercase();
            let aliases = std::mem::take(&mut raw.aliases);
            let profile = Arc::new(raw.into_profile(&id)?);

            registry.profiles.insert(id.clone(), profile.clone());
            for alias in aliases {
                registry.profiles.insert(alias.to_lowercase(), profile.clone());
            }
            registry.primary.push(id);
        }

        Ok(registry)
    }

    /// Resolve a language id or alias, case-insensitively
    pub fn resolve(&self, language: &str) -> Result<Arc<LanguageProfile>, LanguageError> {
        self.profiles
            .get(&language.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| LanguageError::Unknown(language.to_string()))
    }

    /// Primary ids of all supported languages, sorted
    pub fn supported_languages(&self) -> &[String] {
        &self.primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[c]
source_file = "main.c"
compile_command = "gcc -o {{artifact}} {{source}}"
run_command = "{{artifact}}"

[python]
source_file = "main.py"
run_command = "python3 {{artifact}}"
time_limit = ["3", "2"]
memory_limit = ["2", "32"]
aliases = ["py", "python3"]

[java]
source_file = "Main.java"
compile_command = ["javac", "-d", "{{out_dir}}", "{{source}}"]
artifact = "class_dir"
run_command = "java -cp {{artifact_dir}} {{main_class}}"
limit_address_space = false
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_load_languages() {
        let config_file = create_test_config();
        let registry = LanguageRegistry::from_file(config_file.path()).unwrap();

        assert_eq!(registry.supported_languages(), ["c", "java", "python"]);
        assert_eq!(registry.resolve("PY").unwrap().id, "python");
        assert_eq!(registry.resolve("python3").unwrap().id, "python");
        assert!(matches!(
            registry.resolve("cobol"),
            Err(LanguageError::Unknown(_))
        ));
    }

    #[test]
    fn test_builtin_table_parses() {
        let registry = LanguageRegistry::builtin().unwrap();
        for id in ["c", "cpp", "java", "python", "javascript", "ruby", "rust", "sh"] {
            assert!(registry.resolve(id).is_ok(), "missing {}", id);
        }
        assert!(!registry.resolve("java").unwrap().limit_address_space);
        assert!(registry.resolve("c++").unwrap().needs_compilation());
    }

    #[test]
    fn test_command_rendering() {
        let config_file = create_test_config();
        let registry = LanguageRegistry::from_file(config_file.path()).unwrap();

        let c = registry.resolve("c").unwrap();
        let compile = c
            .build_compile_command(Path::new("/w/b/main.c"), Path::new("/w/b"))
            .unwrap();
        assert_eq!(compile, ["gcc", "-o", "/w/b/main", "/w/b/main.c"]);
        assert_eq!(
            c.build_run_command(Path::new("/w/t/main"), Path::new("/w/t")),
            ["/w/t/main"]
        );

        let java = registry.resolve("java").unwrap();
        assert_eq!(java.main_class(), "Main");
        assert_eq!(java.artifact_relative_path(), PathBuf::from("Main.class"));
        assert_eq!(
            java.build_run_command(Path::new("/w/t/Main.class"), Path::new("/w/t")),
            ["java", "-cp", "/w/t", "Main"]
        );

        let python = registry.resolve("python").unwrap();
        assert!(python.build_compile_command(Path::new("x"), Path::new("y")).is_none());
        assert_eq!(python.source_extension(), Some(".py"));
        assert_eq!(python.compiled_artifact_suffix(), "");
    }

    #[test]
    fn test_limit_adjustment() {
        let config_file = create_test_config();
        let registry = LanguageRegistry::from_file(config_file.path()).unwrap();

        let python = registry.resolve("python").unwrap();
        assert_eq!(python.calculate_time_limit(1000), 5000);
        assert_eq!(python.calculate_memory_limit_kb(65536), 65536 * 2 + 32 * 1024);

        let c = registry.resolve("c").unwrap();
        assert_eq!(c.calculate_time_limit(1000), 1000);
        assert_eq!(c.calculate_memory_limit_kb(65536), 65536);
    }

    #[test]
    fn test_invalid_profiles() {
        let err = LanguageRegistry::from_toml_str(
            r#"
[bad]
source_file = "../main.c"
run_command = "x"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LanguageError::Invalid { .. }));

        let err = LanguageRegistry::from_toml_str(
            r#"
[bad]
source_file = "main.c"
artifact = "binary"
run_command = "x"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LanguageError::Invalid { .. }));

        let err = LanguageRegistry::from_toml_str(
            r#"
[bad]
source_file = "main.py"
run_command = "python3 x"
time_limit = ["3"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LanguageError::Invalid { .. }));
    }
}
