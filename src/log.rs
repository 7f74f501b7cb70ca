use backtrace::Backtrace;
use nix::errno::Errno;
use std::{
    collections::HashMap,
    env,
    env::var_os,
    fs::{File, OpenOptions},
    io::{self, BufWriter, Result, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

#[derive(Clone)]
struct LogModule {
    name: String,
    level: LogLevel,
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

pub use LogLevel::*;

struct LogGlobals {
    level_map: HashMap<String, LogLevel>,
    log_modules_cache: HashMap<String, LogModule>,
    /// Possibly buffered
    log_file: Box<dyn Write + Send>,
    default_level: LogLevel,
}

extern "C" fn flush_log_buffer() {
    // A poisoned lock means some thread panicked while logging. Flush anyway.
    let mut lock = match LOG_GLOBALS.lock() {
        Ok(lock) => lock,
        Err(poisoned) => poisoned.into_inner(),
    };
    lock.log_file.flush().unwrap_or(());
}

lazy_static! {
    static ref LOG_GLOBALS: Mutex<LogGlobals> = {
        let maybe_filename = var_os("SNAPBENCH_LOG_FILE");
        let maybe_append_filename = var_os("SNAPBENCH_APPEND_LOG_FILE");
        let mut f: Box<dyn Write + Send> = match (maybe_filename, maybe_append_filename) {
            (Some(filename), _) => match File::create(&filename) {
                Ok(file) => Box::new(file),
                Err(e) => {
                    eprintln!("Could not create `{:?}' specified in SNAPBENCH_LOG_FILE: {}. Logging to stderr.", filename, e);
                    Box::new(io::stderr())
                }
            },
            (None, Some(append_filename)) => {
                match OpenOptions::new().append(true).create(true).open(&append_filename) {
                    Ok(file) => Box::new(file),
                    Err(e) => {
                        eprintln!("Could not append to `{:?}' specified in SNAPBENCH_APPEND_LOG_FILE: {}. Logging to stderr.", append_filename, e);
                        Box::new(io::stderr())
                    }
                }
            }
            (None, None) => Box::new(io::stderr()),
        };

        if let Ok(buf_size) = env::var("SNAPBENCH_LOG_BUFFER") {
            match buf_size.parse::<usize>() {
                Ok(log_buffer_size) => f = Box::new(BufWriter::with_capacity(log_buffer_size, f)),
                Err(_) => eprintln!("Could not parse `{}' in SNAPBENCH_LOG_BUFFER as a number. Ignoring.", buf_size),
            }
        }

        let ret = unsafe { libc::atexit(flush_log_buffer) };
        assert_eq!(ret, 0);

        let (default_level, level_map) = match env::var("SNAPBENCH_LOG") {
            Ok(spec) => init_log_levels(&spec),
            Err(_) => (LogWarn, HashMap::new()),
        };

        Mutex::new(LogGlobals {
            level_map,
            log_modules_cache: HashMap::new(),
            log_file: f,
            default_level,
        })
    };
}

fn log_level_string_to_level(log_level_string: &str) -> LogLevel {
    match log_level_string {
        "fatal" => LogFatal,
        "error" => LogError,
        "warn" => LogWarn,
        "info" => LogInfo,
        "debug" => LogDebug,
        _ => LogWarn,
    }
}

/// Parse a spec like `all:warn,monitor:debug` into a default level and
/// per-module overrides.
fn init_log_levels(spec: &str) -> (LogLevel, HashMap<String, LogLevel>) {
    let mut hm: HashMap<String, LogLevel> = HashMap::new();
    let mut default_level = LogWarn;
    for mod_colon_level in spec.split(',') {
        let res: Vec<&str> = mod_colon_level.splitn(2, ':').collect();
        if res.len() == 2 {
            let mod_name = res[0].trim();
            let log_level_string = res[1].trim();
            if mod_name == "all" {
                default_level = log_level_string_to_level(log_level_string);
            } else {
                hm.insert(
                    mod_name.to_owned(),
                    log_level_string_to_level(log_level_string),
                );
            }
        }
    }
    (default_level, hm)
}

fn get_log_level(module_name: &str, l: &MutexGuard<LogGlobals>) -> LogLevel {
    // Module names are file stems and file names are case sensitive.
    match l.level_map.get(module_name) {
        Some(log_level) => *log_level,
        None => l.default_level,
    }
}

/// `src/monitor/mod.rs` is the `monitor` module, everything else is its file stem.
fn filename_to_module_name(filename: &str) -> String {
    let path = Path::new(filename);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if stem == "mod" {
        if let Some(parent) = path.parent().and_then(|p| p.file_name()) {
            return parent.to_string_lossy().to_string();
        }
    }
    stem
}

fn get_log_module(filename: &str, l: &mut MutexGuard<LogGlobals>) -> LogModule {
    if let Some(log_module) = l.log_modules_cache.get(filename) {
        return log_module.clone();
    }
    let name = filename_to_module_name(filename);
    let level = get_log_level(&name, l);
    let m = LogModule { level, name };
    l.log_modules_cache.insert(filename.to_owned(), m.clone());
    m
}

fn log_name(level: LogLevel) -> &'static str {
    match level {
        LogFatal => "FATAL",
        LogError => "ERROR",
        LogWarn => "WARN",
        LogInfo => "INFO",
        LogDebug => "DEBUG",
    }
}

pub struct NewLineTerminatingOstream {
    enabled: bool,
    message: Vec<u8>,
    lock: MutexGuard<'static, LogGlobals>,
}

impl NewLineTerminatingOstream {
    fn new(
        level: LogLevel,
        filename: &str,
        line: u32,
        always_enabled: bool,
    ) -> Option<NewLineTerminatingOstream> {
        let mut lock = match LOG_GLOBALS.lock() {
            Ok(lock) => lock,
            Err(poisoned) => poisoned.into_inner(),
        };
        let m = get_log_module(filename, &mut lock);
        let enabled = always_enabled || level <= m.level;
        if !enabled {
            return None;
        }

        let mut stream = NewLineTerminatingOstream {
            message: Vec::new(),
            enabled,
            lock,
        };
        if level == LogDebug {
            write!(stream, "[{}] ", m.name).unwrap_or(());
        } else {
            write_prefix(&mut stream, level, filename, line);
        }
        Some(stream)
    }
}

/// Low level. Use is_logging!() macro instead.
pub fn is_logging(level: LogLevel, filename: &str) -> bool {
    let mut lock = match LOG_GLOBALS.lock() {
        Ok(lock) => lock,
        Err(poisoned) => poisoned.into_inner(),
    };
    let m = get_log_module(filename, &mut lock);
    level <= m.level
}

impl Drop for NewLineTerminatingOstream {
    fn drop(&mut self) {
        if self.enabled {
            self.write(b"\n").unwrap_or(0);
            // Moves `message` into the log file but does not flush the log file itself.
            self.flush().unwrap_or(());
        }
    }
}

impl Write for NewLineTerminatingOstream {
    fn flush(&mut self) -> Result<()> {
        if !self.message.is_empty() && self.enabled {
            self.lock.log_file.write_all(&self.message)?;
        }
        self.message.clear();
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.enabled {
            self.message.extend_from_slice(buf);
        }
        // Report the bytes as written even when disabled, otherwise write! fails
        // with WriteZero.
        Ok(buf.len())
    }
}

pub fn write_prefix(stream: &mut dyn Write, level: LogLevel, filename: &str, line: u32) {
    write!(stream, "[{} {}:{}", log_name(level), filename, line).unwrap_or(());
    let err = Errno::last_raw();
    if level <= LogWarn && err != 0 {
        write!(stream, " errno: {}", Errno::from_raw(err)).unwrap_or(());
    }
    write!(stream, "] ").unwrap_or(());
}

/// This is almost always not the method you want. Use log!() macro instead
pub fn log(
    log_level: LogLevel,
    filename: &str,
    line: u32,
    always_enabled: bool,
) -> Option<NewLineTerminatingOstream> {
    NewLineTerminatingOstream::new(log_level, filename, line, always_enabled)
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// After this program continues normally.
#[macro_export]
macro_rules! log {
    ($log_level:expr, $($args:tt)+) => {
        {
            use std::io::Write;
            let maybe_stream = $crate::log::log($log_level, file!(), line!(), false);
            if let Some(mut stream) = maybe_stream {
                write!(stream, $($args)+).unwrap_or(());
            }
        }
    };
}

#[macro_export]
macro_rules! is_logging {
    ($log_level:expr) => {
        $crate::log::is_logging($log_level, file!())
    };
}

/// Outputs to (possibly write buffered) log file (or stderr if no log file was specified)
/// Prints out the backtrace to stderr and aborts.
#[macro_export]
macro_rules! fatal {
    ($($args:tt)+) => {
        {
            {
                use std::io::Write;
                let maybe_stream = $crate::log::log(
                    $crate::log::LogFatal,
                    file!(),
                    line!(),
                    true
                );
                if let Some(mut stream) = maybe_stream {
                    write!(stream, $($args)+).unwrap_or(());
                }
            }
            $crate::log::notifying_abort();
        }
    };
}

/// Output to stderr always. No backtrace -- simply exit.
#[macro_export]
macro_rules! clean_fatal {
    ($($args:tt)+) => {
        {
            $crate::log::write_prefix(&mut std::io::stderr(), $crate::log::LogFatal, file!(), line!());
            eprintln!($($args)+);
            std::process::exit(1);
        }
    };
}

/// Dump the stacktrace and abort.
pub fn notifying_abort() -> ! {
    flush_log_buffer();
    eprintln!("=== Start snapbench backtrace:");
    eprintln!("{:?}", Backtrace::new());
    eprintln!("=== End snapbench backtrace");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_log_levels_test() {
        let (default_level, hm) = init_log_levels("all:info, monitor:debug,harness:error,bogus");
        assert_eq!(default_level, LogInfo);
        assert_eq!(hm.get("monitor"), Some(&LogDebug));
        assert_eq!(hm.get("harness"), Some(&LogError));
        assert_eq!(hm.len(), 2);
    }

    #[test]
    fn unknown_level_is_warn_test() {
        assert_eq!(log_level_string_to_level("loud"), LogWarn);
    }

    #[test]
    fn module_name_test() {
        assert_eq!(filename_to_module_name("src/monitor/mod.rs"), "monitor");
        assert_eq!(
            filename_to_module_name("src/monitor/snapshot_store.rs"),
            "snapshot_store"
        );
        assert_eq!(filename_to_module_name("src/harness.rs"), "harness");
    }
}
