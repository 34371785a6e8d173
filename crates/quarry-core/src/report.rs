//! Crash-report model and the built-in parsers. The full sanitizer grammars
//! live in external parser packages; these defaults cover the common ASan /
//! UBSan / MSan / libFuzzer / Jazzer shapes well enough for triage identity
//! (bug type + trigger point + compressed stack).

/// Parsed identity of a crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    /// e.g. `AddressSanitizer: heap-use-after-free`, `Timeout`.
    pub bug_type: String,
    /// `file:line[:col]` for clike targets, `Class.method(File.java:123)`
    /// for JVM ones.
    pub trigger_point: String,
    /// Compressed stack trace.
    pub summary: String,
}

pub trait ReportParser: Send + Sync {
    fn parse(&self, output: &str) -> Option<CrashReport>;
}

/// Pick a parser for raw replay output.
pub fn parser_for(output: &str) -> &'static dyn ReportParser {
    if output.contains("Java Exception") {
        &JazzerParser
    } else {
        &UnifiedParser
    }
}

pub struct UnifiedParser;
pub struct JazzerParser;

impl ReportParser for UnifiedParser {
    fn parse(&self, output: &str) -> Option<CrashReport> {
        // Timeouts and OOMs have no sanitizer header.
        if output.contains("libFuzzer: timeout") {
            return Some(CrashReport {
                bug_type: "timeout".to_string(),
                trigger_point: first_frame_location(output).unwrap_or_else(|| "unknown".into()),
                summary: compress_stack(output),
            });
        }
        if output.contains("libFuzzer: out-of-memory") {
            return Some(CrashReport {
                bug_type: "out-of-memory".to_string(),
                trigger_point: first_frame_location(output).unwrap_or_else(|| "unknown".into()),
                summary: compress_stack(output),
            });
        }

        let bug_type = sanitizer_bug_type(output)?;
        let trigger_point = first_frame_location(output)?;
        Some(CrashReport {
            bug_type,
            trigger_point,
            summary: compress_stack(output),
        })
    }
}

impl ReportParser for JazzerParser {
    fn parse(&self, output: &str) -> Option<CrashReport> {
        let header = output
            .lines()
            .find(|l| l.contains("Java Exception:") || l.contains("FuzzerSecurityIssue"))?;
        let bug_type = header
            .split("Java Exception:")
            .nth(1)
            .map(str::trim)
            .unwrap_or_else(|| header.trim())
            .to_string();

        let trigger_point = output
            .lines()
            .map(str::trim)
            .find(|l| l.starts_with("at ") && !l.contains("jazzer"))
            .map(|l| l.trim_start_matches("at ").trim().to_string())?;

        Some(CrashReport {
            bug_type,
            trigger_point,
            summary: compress_jvm_stack(output),
        })
    }
}

/// `ERROR: AddressSanitizer: heap-use-after-free on address ...` →
/// `AddressSanitizer: heap-use-after-free`.
fn sanitizer_bug_type(output: &str) -> Option<String> {
    for line in output.lines() {
        let Some(idx) = line.find("ERROR: ") else {
            continue;
        };
        let rest = &line[idx + "ERROR: ".len()..];
        for sanitizer in [
            "AddressSanitizer",
            "MemorySanitizer",
            "UndefinedBehaviorSanitizer",
            "ThreadSanitizer",
            "LeakSanitizer",
        ] {
            if let Some(after) = rest.strip_prefix(sanitizer) {
                let after = after.trim_start_matches(':').trim_start();
                let kind: String = after
                    .split(|c: char| c == ' ' || c == ':')
                    .next()
                    .unwrap_or("")
                    .to_string();
                if kind.is_empty() {
                    return Some(sanitizer.to_string());
                }
                return Some(format!("{sanitizer}: {kind}"));
            }
        }
        // Plain libFuzzer crashes (deadly signal etc.) without a sanitizer header.
        if let Some(after) = rest.strip_prefix("libFuzzer:") {
            let kind = after.trim().split(" after").next().unwrap_or("").trim();
            if !kind.is_empty() {
                return Some(format!("libFuzzer: {kind}"));
            }
        }
        // UBSan runtime errors print `file.c:12:3: runtime error: ...`
        if let Some(pos) = line.find("runtime error:") {
            let location = line[..pos].trim().trim_end_matches(':');
            if !location.is_empty() {
                let kind = line[pos + "runtime error:".len()..]
                    .trim()
                    .split(' ')
                    .take(3)
                    .collect::<Vec<_>>()
                    .join(" ");
                let kind = kind.trim_end_matches(':');
                return Some(format!("UndefinedBehaviorSanitizer: {kind}"));
            }
        }
    }
    None
}

/// First stack frame carrying a source location:
/// `#0 0x55ee in png_read_row /src/libpng/pngread.c:42:7` → `pngread.c` path
/// with line (and column when present).
fn first_frame_location(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim();
        if !line.starts_with('#') {
            continue;
        }
        // Frames look like: #N 0xADDR in symbol /path/file.c:line:col
        let Some(in_idx) = line.find(" in ") else {
            continue;
        };
        let tail = &line[in_idx + 4..];
        let location = tail.rsplit(' ').next().unwrap_or(tail);
        if looks_like_source_location(location) {
            return Some(location.to_string());
        }
    }
    // UBSan style: `/src/foo.c:42:7: runtime error: ...`
    for line in output.lines() {
        if let Some(pos) = line.find("runtime error:") {
            let location = line[..pos].trim().trim_end_matches(':');
            if looks_like_source_location(location) {
                return Some(location.to_string());
            }
        }
    }
    None
}

fn looks_like_source_location(s: &str) -> bool {
    let mut parts = s.rsplitn(3, ':');
    let first = parts.next().unwrap_or("");
    let second = parts.next();
    // file.c:42 or file.c:42:7, with a trailing numeric segment.
    if first.chars().all(|c| c.is_ascii_digit()) && !first.is_empty() {
        return second.is_some();
    }
    false
}

/// Keep only the frame lines, trimmed of addresses, capped at 30 frames.
fn compress_stack(output: &str) -> String {
    let mut frames = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.starts_with('#') && line.contains(" in ") {
            if let Some(idx) = line.find(" in ") {
                frames.push(line[idx + 4..].to_string());
            }
            if frames.len() >= 30 {
                break;
            }
        }
    }
    if frames.is_empty() {
        // Fall back to the first few lines so the summary is never empty.
        output.lines().take(5).collect::<Vec<_>>().join("\n")
    } else {
        frames.join("\n")
    }
}

fn compress_jvm_stack(output: &str) -> String {
    let frames: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("at ") || l.contains("Exception"))
        .take(30)
        .collect();
    if frames.is_empty() {
        output.lines().take(5).collect::<Vec<_>>().join("\n")
    } else {
        frames.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASAN_UAF: &str = "\
INFO: Seed: 12345
==42==ERROR: AddressSanitizer: heap-use-after-free on address 0x602000000050 at pc 0x55ee
READ of size 4 at 0x602000000050 thread T0
    #0 0x55ee72 in png_read_row /src/libpng/pngread.c:42:7
    #1 0x55ee99 in main /src/libpng/contrib/oss-fuzz/libpng_read_fuzzer.cc:150:3
";

    #[test]
    fn parses_asan_heap_uaf() {
        let report = UnifiedParser.parse(ASAN_UAF).unwrap();
        assert_eq!(report.bug_type, "AddressSanitizer: heap-use-after-free");
        assert_eq!(report.trigger_point, "/src/libpng/pngread.c:42:7");
        assert!(report.summary.contains("png_read_row /src/libpng/pngread.c:42:7"));
    }

    #[test]
    fn parses_ubsan_runtime_error() {
        let output = "\
/src/foo/bar.c:42:7: runtime error: signed integer overflow: 2147483647 + 1 cannot be represented
    #0 0x4f00 in do_add /src/foo/bar.c:42:7
";
        let report = UnifiedParser.parse(output).unwrap();
        assert!(report.bug_type.starts_with("UndefinedBehaviorSanitizer:"));
        assert_eq!(report.trigger_point, "/src/foo/bar.c:42:7");
    }

    #[test]
    fn parses_libfuzzer_timeout() {
        let output = "\
ALARM: working on the last Unit for 61 seconds
==12==ERROR: libFuzzer: timeout after 60 seconds
    #0 0x4f00 in slow_loop /src/foo/spin.c:9:1
";
        let report = UnifiedParser.parse(output).unwrap();
        assert_eq!(report.bug_type, "timeout");
        assert_eq!(report.trigger_point, "/src/foo/spin.c:9:1");
    }

    #[test]
    fn parses_jazzer_exception() {
        let output = "\
== Java Exception: com.code_intelligence.jazzer.api.FuzzerSecurityIssueHigh: SQL Injection
    at com.example.Db.query(Db.java:33)
    at com.example.Handler.handle(Handler.java:12)
";
        let report = JazzerParser.parse(output).unwrap();
        assert!(report.bug_type.contains("FuzzerSecurityIssueHigh"));
        assert_eq!(report.trigger_point, "com.example.Db.query(Db.java:33)");
    }

    #[test]
    fn garbage_output_parses_to_none() {
        assert!(UnifiedParser.parse("all tests passed\n").is_none());
        assert!(JazzerParser.parse("BUILD SUCCESSFUL\n").is_none());
    }

    #[test]
    fn parser_selection_prefers_jazzer_for_java() {
        let java = "== Java Exception: java.lang.NullPointerException\n    at a.B.c(B.java:1)\n";
        assert!(parser_for(java).parse(java).is_some());
        assert!(parser_for(ASAN_UAF).parse(ASAN_UAF).is_some());
    }
}
