//! Capture the public contract of a working tree.
//!
//! Heuristic, line-based scans per file extension. Test files and large
//! files are skipped; only names a caller outside the file could use are
//! recorded.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{debug, instrument};

use crate::core::authenticity::is_test_path;
use crate::core::contract::{ContractEndpoint, ContractSnapshot, ContractSymbol};
use crate::stack::markers::list_files;

const MAX_SCAN_BYTES: u64 = 256 * 1024;

macro_rules! re {
    ($name:ident, $pattern:expr) => {
        static $name: LazyLock<Regex> =
            LazyLock::new(|| Regex::new($pattern).expect("snapshot regex should compile"));
    };
}

re!(PY_DEF, r"^(\s*)(?:async\s+)?def\s+(\w+)\s*\(");
re!(PY_CLASS, r"^class\s+([A-Za-z]\w*)");
re!(
    PY_ROUTE,
    r#"^\s*@\w+\.(get|post|put|patch|delete)\(\s*["']([^"']+)["']"#
);
re!(
    PY_FLASK_ROUTE,
    r#"^\s*@\w+\.route\(\s*["']([^"']+)["'](?:.*methods\s*=\s*\[([^\]]*)\])?"#
);
re!(
    JS_EXPORT_FN,
    r"^export\s+(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*\(([^)]*)\)"
);
re!(
    JS_EXPORT_CLASS,
    r"^export\s+(?:default\s+)?(?:abstract\s+)?class\s+([A-Za-z_$][\w$]*)"
);
re!(
    JS_EXPORT_CONST,
    r"^export\s+(?:const|let|var)\s+([A-Za-z_$][\w$]*)"
);
re!(
    JS_EXPORT_TYPE,
    r"^export\s+(?:interface|type|enum)\s+([A-Za-z_$][\w$]*)"
);
re!(
    JS_ROUTE,
    r#"\b(?:app|router|server)\.(get|post|put|patch|delete)\(\s*["'`]([^"'`]+)["'`]"#
);
re!(
    JAVA_TYPE,
    r"^\s*public\s+(?:(?:abstract|final|static|sealed)\s+)*(class|interface|enum|record)\s+(\w+)"
);
re!(
    JAVA_METHOD,
    r"^\s*public\s+(?:(?:static|final|abstract|synchronized|default)\s+)*[\w<>\[\],.?\s]+?\s+(\w+)\s*\(([^)]*)\)"
);
re!(
    JAVA_ROUTE,
    r#"@(Get|Post|Put|Patch|Delete)Mapping\(\s*(?:value\s*=\s*|path\s*=\s*)?"([^"]+)""#
);
re!(
    CS_TYPE,
    r"^\s*public\s+(?:(?:abstract|sealed|static|partial)\s+)*(class|interface|record|struct|enum)\s+(\w+)"
);
re!(
    CS_METHOD,
    r"^\s*public\s+(?:(?:static|virtual|override|async|abstract)\s+)*[\w<>\[\],.?\s]+?\s+(\w+)\s*\(([^)]*)\)"
);
re!(CS_ATTR_ROUTE, r#"\[Http(Get|Post|Put|Patch|Delete)\(\s*"([^"]*)""#);
re!(CS_MAP_ROUTE, r#"\.Map(Get|Post|Put|Patch|Delete)\(\s*"([^"]+)""#);
re!(
    GO_FUNC,
    r"^func\s+(?:\(\s*\w*\s*\*?(\w+)\s*\)\s*)?([A-Z]\w*)\s*\(([^)]*)\)"
);
re!(GO_TYPE, r"^type\s+([A-Z]\w*)\s+(struct|interface)");
re!(
    GO_ROUTE,
    r#"\.(GET|POST|PUT|PATCH|DELETE|HandleFunc|Handle)\(\s*"([^"]+)""#
);

/// Scan every non-test source file under `root`.
#[instrument(skip_all)]
pub fn capture_snapshot(root: &Path) -> Result<ContractSnapshot> {
    let mut symbols = Vec::new();
    let mut endpoints = Vec::new();
    for rel in list_files(root)? {
        if is_test_path(&rel) || language_of(&rel).is_none() {
            continue;
        }
        let path = root.join(&rel);
        let size = fs::metadata(&path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        if size > MAX_SCAN_BYTES {
            debug!(path = %rel, size, "skipping large file");
            continue;
        }
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let (s, e) = scan_source(&rel, &String::from_utf8_lossy(&bytes));
        symbols.extend(s);
        endpoints.extend(e);
    }
    let snapshot = ContractSnapshot::new(symbols, endpoints);
    debug!(
        symbols = snapshot.symbols.len(),
        endpoints = snapshot.endpoints.len(),
        "captured contract snapshot"
    );
    Ok(snapshot)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceLanguage {
    Python,
    Script,
    Java,
    CSharp,
    Go,
}

fn language_of(path: &str) -> Option<SourceLanguage> {
    let ext = path.rsplit_once('.')?.1;
    match ext {
        "py" => Some(SourceLanguage::Python),
        "js" | "mjs" | "cjs" | "ts" | "tsx" | "jsx" => Some(SourceLanguage::Script),
        "java" => Some(SourceLanguage::Java),
        "cs" => Some(SourceLanguage::CSharp),
        "go" => Some(SourceLanguage::Go),
        _ => None,
    }
}

/// Public symbols and endpoints declared in one file.
pub fn scan_source(path: &str, content: &str) -> (Vec<ContractSymbol>, Vec<ContractEndpoint>) {
    let mut scan = Scan {
        path,
        symbols: Vec::new(),
        endpoints: Vec::new(),
    };
    match language_of(path) {
        Some(SourceLanguage::Python) => scan.python(content),
        Some(SourceLanguage::Script) => scan.script(content),
        Some(SourceLanguage::Java) => scan.java(content),
        Some(SourceLanguage::CSharp) => scan.csharp(content),
        Some(SourceLanguage::Go) => scan.go(content),
        None => {}
    }
    (scan.symbols, scan.endpoints)
}

struct Scan<'a> {
    path: &'a str,
    symbols: Vec<ContractSymbol>,
    endpoints: Vec<ContractEndpoint>,
}

impl Scan<'_> {
    fn symbol(&mut self, kind: &str, name: &str, signature: Option<&str>) {
        self.symbols.push(ContractSymbol {
            kind: kind.to_string(),
            name: name.to_string(),
            signature: signature.map(collapse_whitespace),
            path: self.path.to_string(),
        });
    }

    fn endpoint(&mut self, method: &str, route: &str) {
        self.endpoints.push(ContractEndpoint {
            method: method.to_ascii_uppercase(),
            route: route.to_string(),
            path: self.path.to_string(),
        });
    }

    fn python(&mut self, content: &str) {
        let lines: Vec<&str> = content.lines().collect();
        let mut class: Option<String> = None;
        for (i, line) in lines.iter().enumerate() {
            if let Some(caps) = PY_CLASS.captures(line) {
                let name = caps[1].to_string();
                self.symbol("class", &name, None);
                class = Some(name);
                continue;
            }
            if let Some(caps) = PY_ROUTE.captures(line) {
                self.endpoint(&caps[1], &caps[2]);
            } else if let Some(caps) = PY_FLASK_ROUTE.captures(line) {
                let route = caps[1].to_string();
                let methods = caps.get(2).map(|m| m.as_str()).unwrap_or("\"GET\"");
                for method in methods.split(',') {
                    let method = method.trim().trim_matches(['"', '\'']);
                    if !method.is_empty() {
                        self.endpoint(method, &route);
                    }
                }
            }
            if let Some(caps) = PY_DEF.captures(line) {
                let indent = caps[1].len();
                let name = &caps[2];
                let args = python_args(&lines[i..], caps.get_match().end());
                if indent == 0 {
                    class = None;
                    if !name.starts_with('_') {
                        self.symbol("function", name, Some(&args));
                    }
                } else if let Some(owner) = class.clone()
                    && (!name.starts_with('_') || name == "__init__")
                {
                    self.symbol("method", &format!("{owner}.{name}"), Some(&args));
                }
            } else if !line.starts_with([' ', '\t', '@', '#', ')']) && !line.trim().is_empty() {
                class = None;
            }
        }
    }

    fn script(&mut self, content: &str) {
        for line in content.lines() {
            if let Some(caps) = JS_EXPORT_FN.captures(line) {
                self.symbol("function", &caps[1], Some(&caps[2]));
            } else if let Some(caps) = JS_EXPORT_CLASS.captures(line) {
                self.symbol("class", &caps[1], None);
            } else if let Some(caps) = JS_EXPORT_TYPE.captures(line) {
                self.symbol("type", &caps[1], None);
            } else if let Some(caps) = JS_EXPORT_CONST.captures(line) {
                self.symbol("const", &caps[1], None);
            }
            for caps in JS_ROUTE.captures_iter(line) {
                self.endpoint(&caps[1], &caps[2]);
            }
        }
    }

    fn java(&mut self, content: &str) {
        for line in content.lines() {
            if let Some(caps) = JAVA_TYPE.captures(line) {
                self.symbol(&caps[1], &caps[2], None);
            } else if let Some(caps) = JAVA_METHOD.captures(line) {
                self.symbol("method", &caps[1], Some(&caps[2]));
            }
            if let Some(caps) = JAVA_ROUTE.captures(line) {
                self.endpoint(&caps[1], &caps[2]);
            }
        }
    }

    fn csharp(&mut self, content: &str) {
        for line in content.lines() {
            if let Some(caps) = CS_TYPE.captures(line) {
                self.symbol(&caps[1], &caps[2], None);
            } else if let Some(caps) = CS_METHOD.captures(line) {
                self.symbol("method", &caps[1], Some(&caps[2]));
            }
            if let Some(caps) = CS_ATTR_ROUTE.captures(line) {
                self.endpoint(&caps[1], &caps[2]);
            }
            for caps in CS_MAP_ROUTE.captures_iter(line) {
                self.endpoint(&caps[1], &caps[2]);
            }
        }
    }

    fn go(&mut self, content: &str) {
        for line in content.lines() {
            if let Some(caps) = GO_FUNC.captures(line) {
                match caps.get(1) {
                    Some(receiver) => {
                        let name = format!("{}.{}", receiver.as_str(), &caps[2]);
                        self.symbol("method", &name, Some(&caps[3]));
                    }
                    None => self.symbol("function", &caps[2], Some(&caps[3])),
                }
            } else if let Some(caps) = GO_TYPE.captures(line) {
                self.symbol(&caps[2], &caps[1], None);
            }
            for caps in GO_ROUTE.captures_iter(line) {
                let method = match &caps[1] {
                    "HandleFunc" | "Handle" => "ANY",
                    other => other,
                };
                self.endpoint(method, &caps[2]);
            }
        }
    }
}

/// Argument text of a `def` whose `(` ends at byte `open` of `lines[0]`,
/// following the list across lines until the closing parenthesis.
fn python_args(lines: &[&str], open: usize) -> String {
    let mut args = String::new();
    let mut depth = 0usize;
    let first = lines.first().map(|l| &l[open..]).unwrap_or_default();
    for chunk in std::iter::once(first).chain(lines.iter().skip(1).copied()) {
        for c in chunk.chars() {
            match c {
                '(' | '[' => depth += 1,
                ')' if depth == 0 => return args,
                ')' | ']' => depth = depth.saturating_sub(1),
                _ => {}
            }
            args.push(c);
        }
        args.push(' ');
    }
    args
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(symbols: &[ContractSymbol]) -> Vec<String> {
        symbols
            .iter()
            .map(|s| format!("{}:{}", s.kind, s.name))
            .collect()
    }

    #[test]
    fn python_functions_classes_and_routes() {
        let source = "\
from fastapi import FastAPI
app = FastAPI()

class Loan:
    def __init__(self, principal):
        pass

    def payment(self, months: int) -> float:
        return 0.0

    def _private(self):
        pass

def amortize(principal, rate,
             months):
    pass

def _helper():
    pass

@app.get(\"/loans/{id}\")
def read_loan(id: int):
    pass
";
        let (symbols, endpoints) = scan_source("app/loans.py", source);
        assert_eq!(
            names(&symbols),
            vec![
                "class:Loan",
                "method:Loan.__init__",
                "method:Loan.payment",
                "function:amortize",
                "function:read_loan",
            ]
        );
        assert_eq!(symbols[2].signature.as_deref(), Some("self, months: int"));
        assert_eq!(symbols[3].signature.as_deref(), Some("principal, rate, months"));
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].method, "GET");
        assert_eq!(endpoints[0].route, "/loans/{id}");
    }

    #[test]
    fn script_exports_and_express_routes() {
        let source = "\
export function total(items, tax) { return 0; }
export class Cart {}
export const VERSION = '1';
function internal() {}
router.post('/cart', handler);
";
        let (symbols, endpoints) = scan_source("src/cart.ts", source);
        assert_eq!(
            names(&symbols),
            vec!["function:total", "class:Cart", "const:VERSION"]
        );
        assert_eq!(endpoints[0].method, "POST");
    }

    #[test]
    fn go_exported_only() {
        let source = "\
package loans

type Schedule struct {}
func Amortize(p float64, n int) []float64 { return nil }
func (s *Schedule) Total() float64 { return 0 }
func helper() {}
";
        let (symbols, _) = scan_source("loans/loans.go", source);
        assert_eq!(
            names(&symbols),
            vec!["struct:Schedule", "function:Amortize", "method:Schedule.Total"]
        );
    }

    #[test]
    fn java_and_csharp_public_members() {
        let java = "\
@RestController
public class LoanController {
    @GetMapping(\"/loans\")
    public List<Loan> list(int page) { return null; }
    private void hidden() {}
}
";
        let (symbols, endpoints) = scan_source("src/main/java/LoanController.java", java);
        assert_eq!(names(&symbols), vec!["class:LoanController", "method:list"]);
        assert_eq!(endpoints[0].route, "/loans");

        let csharp = "public sealed class Calc\n{\n    public decimal Add(decimal a, decimal b) => a + b;\n}\n";
        let (symbols, _) = scan_source("Calc.cs", csharp);
        assert_eq!(names(&symbols), vec!["class:Calc", "method:Add"]);
    }

    #[test]
    fn snapshot_skips_tests_and_detects_removals() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("tests")).expect("mkdir");
        fs::write(temp.path().join("calc.py"), "def add(a, b):\n    return a + b\n").expect("write");
        fs::write(temp.path().join("tests/test_calc.py"), "def test_add():\n    pass\n")
            .expect("write");
        let lock = capture_snapshot(temp.path()).expect("snapshot");
        assert_eq!(names(&lock.symbols), vec!["function:add"]);

        fs::write(temp.path().join("calc.py"), "def add(a, b, c):\n    return a + b\n").expect("write");
        let current = capture_snapshot(temp.path()).expect("snapshot");
        assert_eq!(lock.violations(&current).len(), 1);
    }

    #[test]
    fn unchanged_overloads_and_property_setters_keep_the_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("app")).expect("mkdir");
        fs::write(
            temp.path().join("Calc.java"),
            "public class Calc {\n    public int add(int a, int b) { return a + b; }\n    public double add(double a, double b) { return a + b; }\n}\n",
        )
        .expect("write");
        fs::write(
            temp.path().join("app/loan.py"),
            "class Loan:\n    @property\n    def rate(self):\n        return self._rate\n\n    @rate.setter\n    def rate(self, value):\n        self._rate = value\n",
        )
        .expect("write");

        let lock = capture_snapshot(temp.path()).expect("snapshot");
        let current = capture_snapshot(temp.path()).expect("snapshot");
        assert!(lock.violations(&current).is_empty(), "{:?}", lock.violations(&current));
        assert_eq!(lock.merge_additive(&current).expect("additive"), lock);
    }
}
