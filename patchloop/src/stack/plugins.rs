//! Built-in stack plugins: marker detection and per-language defaults.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::stack::spec::{Commands, Toolchain};

/// Closed set of stack plugins, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StackPlugin {
    Python,
    Node,
    Java,
    Dotnet,
    Go,
    Generic,
}

/// Registration order; earlier plugins win ties.
pub const PLUGINS: [StackPlugin; 6] = [
    StackPlugin::Python,
    StackPlugin::Node,
    StackPlugin::Java,
    StackPlugin::Dotnet,
    StackPlugin::Go,
    StackPlugin::Generic,
];

/// Detection result. `confidence` is 0..=100.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub plugin: StackPlugin,
    pub language: String,
    pub confidence: u8,
}

/// Repository file list with the lookups plugins need.
#[derive(Debug, Clone, Copy)]
pub struct RepoFiles<'a> {
    files: &'a [String],
}

impl<'a> RepoFiles<'a> {
    pub fn new(files: &'a [String]) -> Self {
        Self { files }
    }

    /// File at the repository root.
    fn has(&self, name: &str) -> bool {
        self.files.iter().any(|f| f == name)
    }

    /// File with the extension anywhere in the tree.
    fn has_ext(&self, ext: &str) -> bool {
        self.files.iter().any(|f| f.ends_with(ext))
    }
}

impl StackPlugin {
    pub fn name(self) -> &'static str {
        match self {
            StackPlugin::Python => "python",
            StackPlugin::Node => "node",
            StackPlugin::Java => "java",
            StackPlugin::Dotnet => "dotnet",
            StackPlugin::Go => "go",
            StackPlugin::Generic => "generic",
        }
    }

    pub fn supports(self, language: &str) -> bool {
        match self {
            StackPlugin::Python => language == "python",
            StackPlugin::Node => matches!(language, "javascript" | "typescript"),
            StackPlugin::Java => language == "java",
            StackPlugin::Dotnet => matches!(language, "dotnet" | "csharp"),
            StackPlugin::Go => language == "go",
            StackPlugin::Generic => true,
        }
    }

    /// First registered plugin supporting `language` (generic for unknown ones).
    pub fn for_language(language: &str) -> StackPlugin {
        PLUGINS
            .into_iter()
            .find(|p| p.supports(language))
            .unwrap_or(StackPlugin::Generic)
    }

    /// Confidence and candidate language; zero confidence means "not this stack".
    pub fn detect(self, repo: RepoFiles<'_>) -> (u8, &'static str) {
        match self {
            StackPlugin::Python => {
                if repo.has("pyproject.toml") || repo.has("requirements.txt") {
                    (90, "python")
                } else if repo.has_ext(".py") {
                    (60, "python")
                } else {
                    (0, "")
                }
            }
            StackPlugin::Node => {
                if repo.has("package.json") {
                    if repo.has("tsconfig.json") || repo.has_ext(".ts") {
                        (95, "typescript")
                    } else {
                        (95, "javascript")
                    }
                } else if repo.has_ext(".ts") {
                    (60, "typescript")
                } else if repo.has_ext(".js") {
                    (50, "javascript")
                } else {
                    (0, "")
                }
            }
            StackPlugin::Java => {
                if repo.has("pom.xml") || repo.has("gradlew") {
                    (95, "java")
                } else if repo.has_ext(".java") {
                    (60, "java")
                } else {
                    (0, "")
                }
            }
            StackPlugin::Dotnet => {
                if repo.has_ext(".sln") || repo.has_ext(".csproj") {
                    (95, "dotnet")
                } else if repo.has_ext(".cs") {
                    (60, "dotnet")
                } else {
                    (0, "")
                }
            }
            StackPlugin::Go => {
                if repo.has("go.mod") {
                    (95, "go")
                } else if repo.has_ext(".go") {
                    (60, "go")
                } else {
                    (0, "")
                }
            }
            StackPlugin::Generic => (0, ""),
        }
    }

    pub fn default_toolchain(self) -> Toolchain {
        let (kind, version) = match self {
            StackPlugin::Python => ("python", "3.11"),
            StackPlugin::Node => ("node", "20"),
            StackPlugin::Java => ("java", "21"),
            StackPlugin::Dotnet => ("dotnet", "8.0.x"),
            StackPlugin::Go => ("go", "1.22.x"),
            StackPlugin::Generic => ("generic", ""),
        };
        Toolchain {
            kind: kind.to_string(),
            version: version.to_string(),
        }
    }

    pub fn default_commands(self, repo: RepoFiles<'_>) -> Commands {
        let (test, build) = match self {
            StackPlugin::Python => {
                if repo.has("pyproject.toml") {
                    ("python -m pytest -q".to_string(), String::new())
                } else {
                    ("pytest -q".to_string(), String::new())
                }
            }
            StackPlugin::Node => (format!("{} test", package_manager(repo)), String::new()),
            StackPlugin::Java => {
                if repo.has("gradlew") && !repo.has("pom.xml") {
                    (
                        "./gradlew -q test".to_string(),
                        "./gradlew -q assemble".to_string(),
                    )
                } else {
                    (
                        "mvn -q test".to_string(),
                        "mvn -q -DskipTests package".to_string(),
                    )
                }
            }
            StackPlugin::Dotnet => ("dotnet test".to_string(), "dotnet build".to_string()),
            StackPlugin::Go => ("go test ./...".to_string(), String::new()),
            StackPlugin::Generic => (String::new(), String::new()),
        };
        Commands {
            test,
            build,
            ..Commands::default()
        }
    }

    pub fn allowed_test_prefixes(self) -> Vec<String> {
        let prefixes: &[&str] = match self {
            StackPlugin::Python => &["pytest", "python -m pytest", "python3 -m pytest"],
            StackPlugin::Node => &[
                "npm test",
                "npm run test",
                "pnpm test",
                "pnpm run test",
                "yarn test",
                "node --test",
            ],
            StackPlugin::Java => &["mvn test", "mvn -q test", "./gradlew test", "./gradlew -q test"],
            StackPlugin::Dotnet => &["dotnet test"],
            StackPlugin::Go => &["go test ./..."],
            StackPlugin::Generic => &[],
        };
        prefixes.iter().map(|p| p.to_string()).collect()
    }

    /// Marker globs used when the catalog entry declares none.
    pub fn marker_patterns(self) -> &'static [&'static str] {
        match self {
            StackPlugin::Python => &["pyproject.toml", "requirements.txt", "setup.py", "**/*.py"],
            StackPlugin::Node => &["package.json", "**/*.ts", "**/*.js"],
            StackPlugin::Java => &["pom.xml", "gradlew", "build.gradle", "**/*.java"],
            StackPlugin::Dotnet => &["**/*.sln", "**/*.csproj", "**/*.cs"],
            StackPlugin::Go => &["go.mod", "**/*.go"],
            StackPlugin::Generic => &[],
        }
    }

    pub fn metadata(self, repo: RepoFiles<'_>) -> BTreeMap<String, String> {
        let mut meta = BTreeMap::new();
        match self {
            StackPlugin::Node => {
                meta.insert(
                    "package_manager".to_string(),
                    package_manager(repo).to_string(),
                );
            }
            StackPlugin::Java => {
                let tool = if repo.has("pom.xml") {
                    "maven"
                } else if repo.has("gradlew") {
                    "gradle"
                } else {
                    ""
                };
                meta.insert("java_build_tool".to_string(), tool.to_string());
            }
            _ => {}
        }
        meta
    }
}

fn package_manager(repo: RepoFiles<'_>) -> &'static str {
    if repo.has("pnpm-lock.yaml") {
        "pnpm"
    } else if repo.has("yarn.lock") {
        "yarn"
    } else {
        "npm"
    }
}

/// Highest confidence wins; ties keep registration order. Generic is the
/// zero-confidence fallback.
pub fn detect(files: &[String]) -> Detection {
    let repo = RepoFiles::new(files);
    let mut best = Detection {
        plugin: StackPlugin::Generic,
        language: String::new(),
        confidence: 0,
    };
    for plugin in PLUGINS {
        let (confidence, language) = plugin.detect(repo);
        if confidence > best.confidence {
            best = Detection {
                plugin,
                language: language.to_string(),
                confidence,
            };
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn manifest_beats_loose_sources() {
        let detection = detect(&files(&["scripts/tool.py", "package.json", "src/index.js"]));
        assert_eq!(detection.plugin, StackPlugin::Node);
        assert_eq!(detection.language, "javascript");

        let detection = detect(&files(&["package.json", "tsconfig.json"]));
        assert_eq!(detection.language, "typescript");
    }

    #[test]
    fn ties_keep_registration_order() {
        // Java and Go both score 95; Java registers first.
        let detection = detect(&files(&["pom.xml", "go.mod"]));
        assert_eq!(detection.plugin, StackPlugin::Java);
    }

    #[test]
    fn empty_repo_falls_back_to_generic() {
        let detection = detect(&[]);
        assert_eq!(detection.plugin, StackPlugin::Generic);
        assert_eq!(detection.confidence, 0);
        assert!(detection.language.is_empty());
        assert!(
            StackPlugin::Generic
                .default_commands(RepoFiles::new(&[]))
                .test
                .is_empty()
        );
    }

    #[test]
    fn defaults_follow_repository_layout() {
        let repo_files = files(&["pyproject.toml"]);
        let commands = StackPlugin::Python.default_commands(RepoFiles::new(&repo_files));
        assert_eq!(commands.test, "python -m pytest -q");

        let repo_files = files(&["package.json", "pnpm-lock.yaml"]);
        let repo = RepoFiles::new(&repo_files);
        assert_eq!(StackPlugin::Node.default_commands(repo).test, "pnpm test");
        assert_eq!(
            StackPlugin::Node.metadata(repo).get("package_manager"),
            Some(&"pnpm".to_string())
        );
        assert_eq!(StackPlugin::for_language("csharp"), StackPlugin::Dotnet);
        assert_eq!(StackPlugin::for_language("rust"), StackPlugin::Generic);
    }
}
