use crate::commands::{
    bench_options::BenchOptions,
    exit_result::{ExitResult, EXIT_SETUP},
    BenchCommand,
};
use serde::Serialize;
use snapbench::{
    address_space::{
        memory_region::MemoryRegion,
        normalizer_code_address,
        region_catalog::{ExclusionReason, ProcMapsCatalog, RegionCatalog, RegionPolicy, Verdict},
    },
    util::approximate_stack_pointer,
};
use std::io::{self, stdout, Write};

pub struct MapsCommand {
    json: bool,
}

#[derive(Serialize)]
struct MapRecord {
    start: usize,
    end: usize,
    perms: String,
    backing: String,
    verdict: String,
}

impl MapsCommand {
    pub fn new(options: &BenchOptions) -> MapsCommand {
        MapsCommand { json: options.json }
    }

    /// The policy a harness started from here would apply, minus the
    /// harness-private mappings that do not exist yet.
    fn policy() -> RegionPolicy {
        let mut policy = RegionPolicy::new();
        policy
            .exclude_containing(approximate_stack_pointer(), ExclusionReason::SchedulerStack)
            .exclude_containing(normalizer_code_address(), ExclusionReason::HarnessCode);
        policy
    }

    fn maps(&self, regions: &[MemoryRegion], out: &mut dyn Write) -> io::Result<()> {
        let classified = Self::policy().classify(regions);
        if self.json {
            let records: Vec<MapRecord> = classified
                .iter()
                .map(|(region, verdict)| MapRecord {
                    start: region.start(),
                    end: region.end(),
                    perms: perms(region),
                    backing: region.backing().to_string(),
                    verdict: verdict.to_string(),
                })
                .collect();
            serde_json::to_writer_pretty(&mut *out, &records)?;
            return writeln!(out);
        }

        let mut monitored_bytes = 0;
        for (region, verdict) in &classified {
            if *verdict == Verdict::Monitored {
                monitored_bytes += region.size();
            }
            writeln!(out, "{:<100} # {}", region.str(), verdict)?;
        }
        writeln!(
            out,
            "{} region(s), {} KiB would be monitored",
            classified.len(),
            monitored_bytes / 1024
        )
    }
}

fn perms(region: &MemoryRegion) -> String {
    let mut s = String::with_capacity(4);
    s.push(if region.is_readable() { 'r' } else { '-' });
    s.push(if region.is_writable() { 'w' } else { '-' });
    s.push(if region.is_executable() { 'x' } else { '-' });
    s.push(if region.is_private() { 'p' } else { 's' });
    s
}

impl BenchCommand for MapsCommand {
    fn run(&mut self) -> ExitResult<()> {
        let regions = match ProcMapsCatalog::new().regions() {
            Ok(r) => r,
            Err(e) => return ExitResult::harness(e, EXIT_SETUP),
        };
        match self.maps(&regions, &mut stdout()) {
            Ok(()) => ExitResult::Ok(()),
            Err(e) => ExitResult::err_from(e, EXIT_SETUP),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAPS: &str = "\
55d0c1c39000-55d0c1c5a000 rw-p 00000000 00:00 0                          [heap]
7f2b1c021000-7f2b20000000 ---p 00000000 00:00 0
7ffd8a9f4000-7ffd8a9f8000 r--p 00000000 00:00 0                          [vvar]
";

    fn regions() -> Vec<MemoryRegion> {
        ProcMapsCatalog::parse_maps(Cursor::new(MAPS)).unwrap()
    }

    #[test]
    fn text_listing_test() {
        let mut out = Vec::new();
        MapsCommand { json: false }.maps(&regions(), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("# monitored"), "{}", lines[0]);
        assert!(lines[1].ends_with("# skipped: no access"), "{}", lines[1]);
        assert!(lines[2].ends_with("# skipped: pseudo mapping"), "{}", lines[2]);
        assert_eq!(lines[3], "3 region(s), 132 KiB would be monitored");
    }

    #[test]
    fn json_listing_test() {
        let mut out = Vec::new();
        MapsCommand { json: true }.maps(&regions(), &mut out).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        let records = v.as_array().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["perms"], "rw-p");
        assert_eq!(records[0]["backing"], "[heap]");
        assert_eq!(records[0]["verdict"], "monitored");
        assert_eq!(records[1]["verdict"], "skipped: no access");
    }

    #[test]
    fn live_maps_exclude_own_stack_and_code_test() {
        let regions = ProcMapsCatalog::new().regions().unwrap();
        let classified = MapsCommand::policy().classify(&regions);
        let sp = approximate_stack_pointer();
        let (_, verdict) = classified
            .iter()
            .find(|(r, _)| r.contains_ptr(sp))
            .unwrap();
        assert_eq!(*verdict, Verdict::Excluded(ExclusionReason::SchedulerStack));
        let code = normalizer_code_address();
        let (_, verdict) = classified
            .iter()
            .find(|(r, _)| r.contains_ptr(code))
            .unwrap();
        assert_eq!(*verdict, Verdict::Excluded(ExclusionReason::HarnessCode));
    }
}
