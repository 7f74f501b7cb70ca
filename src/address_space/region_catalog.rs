use super::{
    memory_range::MemoryRange,
    memory_region::{Backing, MemoryRegion},
};
use crate::error::HarnessError;
use libc::ino_t;
use nix::sys::{mman::ProtFlags, stat::makedev};
use std::{
    fmt::{Display, Formatter},
    fs::File,
    io::{BufRead, BufReader},
    path::PathBuf,
};

/// Anything that can list the memory regions of this process.
pub trait RegionCatalog {
    fn regions(&mut self) -> Result<Vec<MemoryRegion>, HarnessError>;
}

/// Reads `/proc/self/maps` (or a file in the same format).
pub struct ProcMapsCatalog {
    maps_path: PathBuf,
}

impl ProcMapsCatalog {
    pub fn new() -> ProcMapsCatalog {
        ProcMapsCatalog {
            maps_path: PathBuf::from("/proc/self/maps"),
        }
    }

    pub fn from_path<P: Into<PathBuf>>(maps_path: P) -> ProcMapsCatalog {
        ProcMapsCatalog {
            maps_path: maps_path.into(),
        }
    }

    pub fn parse_maps<R: BufRead>(reader: R) -> Result<Vec<MemoryRegion>, HarnessError> {
        let mut regions = Vec::new();
        for (lineno, maybe_line) in reader.lines().enumerate() {
            let raw_line = maybe_line?;
            if raw_line.trim().is_empty() {
                continue;
            }
            let region = Self::parse_rawline(&raw_line).map_err(|what| {
                HarnessError::Catalog(format!(
                    "line {}: {}: `{}'",
                    lineno + 1,
                    what,
                    raw_line
                ))
            })?;
            regions.push(region);
        }
        Ok(regions)
    }

    fn parse_rawline(raw_line: &str) -> Result<MemoryRegion, &'static str> {
        let mut iter = raw_line.splitn(6, ' ');
        let addr_range = iter.next().ok_or("missing address range")?;
        let perms_s = iter.next().ok_or("missing permissions")?;
        let offset_s = iter.next().ok_or("missing offset")?;
        let device = iter.next().ok_or("missing device")?;
        let inode_s = iter.next().ok_or("missing inode")?;
        // Anonymous regions have no name at all, not even the separating space.
        let filename_unescaped = iter
            .next()
            .unwrap_or("")
            .trim_start_matches(' ')
            .trim_end_matches('\n');

        let mut addr_iter = addr_range.split('-');
        let addr_low_s = addr_iter.next().ok_or("missing start address")?;
        let addr_high_s = addr_iter.next().ok_or("missing end address")?;

        let mut dev_iter = device.split(':');
        let dev_major_s = dev_iter.next().ok_or("missing device major")?;
        let dev_minor_s = dev_iter.next().ok_or("missing device minor")?;

        let addr_low = usize::from_str_radix(addr_low_s, 16).map_err(|_| "bad start address")?;
        let addr_high = usize::from_str_radix(addr_high_s, 16).map_err(|_| "bad end address")?;
        if addr_high < addr_low {
            return Err("end address below start address");
        }
        let offset = u64::from_str_radix(offset_s, 16).map_err(|_| "bad offset")?;
        let dev_major = u64::from_str_radix(dev_major_s, 16).map_err(|_| "bad device major")?;
        let dev_minor = u64::from_str_radix(dev_minor_s, 16).map_err(|_| "bad device minor")?;
        let inode = inode_s.parse::<ino_t>().map_err(|_| "bad inode")?;
        if perms_s.len() != 4 {
            return Err("bad permissions");
        }

        let filename = Self::unescape(filename_unescaped);
        Ok(MemoryRegion::new_with_opts(
            addr_low,
            addr_high,
            Backing::from_fsname(&filename),
            makedev(dev_major, dev_minor),
            inode,
            Self::get_prot(perms_s),
            perms_s.ends_with('p'),
            offset,
        ))
    }

    /// The kernel escapes newlines in path names as `\012`.
    fn unescape(filename_unescaped: &str) -> String {
        let mut filename = String::with_capacity(filename_unescaped.len());
        let mut iter = filename_unescaped.chars();
        while let Some(c) = iter.next() {
            if c != '\\' {
                filename.push(c);
                continue;
            }
            let c1 = iter.next();
            let c2 = iter.next();
            let c3 = iter.next();
            if c1 == Some('0') && c2 == Some('1') && c3 == Some('2') {
                filename.push('\n');
            } else {
                filename.push(c);
                filename.extend(c1);
                filename.extend(c2);
                filename.extend(c3);
            }
        }
        filename
    }

    fn get_prot(perms_s: &str) -> ProtFlags {
        let mut prot = ProtFlags::empty();
        if perms_s.contains('r') {
            prot |= ProtFlags::PROT_READ;
        }
        if perms_s.contains('w') {
            prot |= ProtFlags::PROT_WRITE;
        }
        if perms_s.contains('x') {
            prot |= ProtFlags::PROT_EXEC;
        }
        prot
    }
}

impl Default for ProcMapsCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionCatalog for ProcMapsCatalog {
    fn regions(&mut self) -> Result<Vec<MemoryRegion>, HarnessError> {
        let file = File::open(&self.maps_path).map_err(|e| {
            HarnessError::Catalog(format!("failed to open {}: {}", self.maps_path.display(), e))
        })?;
        Self::parse_maps(BufReader::new(file))
    }
}

/// A caller-supplied region list, for monitoring only part of the address space.
pub struct FixedCatalog {
    regions: Vec<MemoryRegion>,
}

impl FixedCatalog {
    pub fn new(regions: Vec<MemoryRegion>) -> FixedCatalog {
        FixedCatalog { regions }
    }
}

impl RegionCatalog for FixedCatalog {
    fn regions(&mut self) -> Result<Vec<MemoryRegion>, HarnessError> {
        Ok(self.regions.clone())
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ExclusionReason {
    /// Stacks and tables the harness allocated for itself.
    HarnessPrivate,
    /// The stack the scheduler runs on.
    SchedulerStack,
    /// Text the normalizer executes while it remaps everything else.
    HarnessCode,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Verdict {
    Monitored,
    PseudoMapping,
    NoAccess,
    Excluded(ExclusionReason),
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Monitored => write!(f, "monitored"),
            Verdict::PseudoMapping => write!(f, "skipped: pseudo mapping"),
            Verdict::NoAccess => write!(f, "skipped: no access"),
            Verdict::Excluded(ExclusionReason::HarnessPrivate) => {
                write!(f, "skipped: harness-private")
            }
            Verdict::Excluded(ExclusionReason::SchedulerStack) => {
                write!(f, "skipped: scheduler stack")
            }
            Verdict::Excluded(ExclusionReason::HarnessCode) => write!(f, "skipped: harness code"),
        }
    }
}

#[derive(Copy, Clone, Debug)]
enum Exclusion {
    /// Cut exactly this range out of whatever region overlaps it.
    Range(MemoryRange, ExclusionReason),
    /// Drop the whole region containing this address.
    Containing(usize, ExclusionReason),
}

/// Decides which parts of the catalog get normalized and monitored.
#[derive(Clone, Debug, Default)]
pub struct RegionPolicy {
    exclusions: Vec<Exclusion>,
}

impl RegionPolicy {
    pub fn new() -> RegionPolicy {
        RegionPolicy::default()
    }

    pub fn exclude_range(&mut self, range: MemoryRange, reason: ExclusionReason) -> &mut Self {
        if !range.is_empty() {
            self.exclusions.push(Exclusion::Range(range, reason));
        }
        self
    }

    pub fn exclude_containing(&mut self, addr: usize, reason: ExclusionReason) -> &mut Self {
        self.exclusions.push(Exclusion::Containing(addr, reason));
        self
    }

    /// Every piece of every region with its verdict, in address order.
    /// Regions are split where a harness-private range cuts through them.
    pub fn classify(&self, regions: &[MemoryRegion]) -> Vec<(MemoryRegion, Verdict)> {
        let mut result = Vec::with_capacity(regions.len());
        for region in regions {
            if region.is_pseudo_mapping() {
                result.push((region.clone(), Verdict::PseudoMapping));
                continue;
            }
            if region.has_no_access() {
                result.push((region.clone(), Verdict::NoAccess));
                continue;
            }
            if let Some(reason) = self.whole_region_exclusion(region) {
                result.push((region.clone(), Verdict::Excluded(reason)));
                continue;
            }

            let mut pieces = vec![(region.range(), Verdict::Monitored)];
            for exclusion in &self.exclusions {
                if let Exclusion::Range(cut, reason) = exclusion {
                    pieces = pieces
                        .into_iter()
                        .flat_map(|(piece, verdict)| {
                            if verdict != Verdict::Monitored || !piece.intersects(cut) {
                                return vec![(piece, verdict)];
                            }
                            let mut split: Vec<(MemoryRange, Verdict)> = piece
                                .subtract(cut)
                                .into_iter()
                                .map(|p| (p, Verdict::Monitored))
                                .collect();
                            split.push((piece.intersect(cut), Verdict::Excluded(*reason)));
                            split
                        })
                        .collect();
                }
            }
            pieces.sort_by_key(|(piece, _)| piece.start());
            for (piece, verdict) in pieces {
                result.push((region.subrange(piece), verdict));
            }
        }
        result
    }

    /// The monitored set: only the pieces classified as `Monitored`.
    pub fn select(&self, regions: &[MemoryRegion]) -> Vec<MemoryRegion> {
        self.classify(regions)
            .into_iter()
            .filter(|(_, verdict)| *verdict == Verdict::Monitored)
            .map(|(region, _)| region)
            .collect()
    }

    fn whole_region_exclusion(&self, region: &MemoryRegion) -> Option<ExclusionReason> {
        self.exclusions.iter().find_map(|exclusion| match exclusion {
            Exclusion::Containing(addr, reason) if region.contains_ptr(*addr) => Some(*reason),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::page_size;
    use std::io::Cursor;

    const SAMPLE_MAPS: &str = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 1835012                    /usr/bin/cat
55d0c0a02000-55d0c0a07000 r-xp 00002000 08:01 1835012                    /usr/bin/cat
55d0c1c39000-55d0c1c5a000 rw-p 00000000 00:00 0                          [heap]
7f2b1c000000-7f2b1c021000 rw-p 00000000 00:00 0
7f2b1c021000-7f2b20000000 ---p 00000000 00:00 0
7f2b2a3f0000-7f2b2a3f2000 rw-s 00000000 00:05 1234                       /dev/zero (deleted)
7ffd8a9a4000-7ffd8a9c5000 rw-p 00000000 00:00 0                          [stack]
7ffd8a9f4000-7ffd8a9f8000 r--p 00000000 00:00 0                          [vvar]
7ffd8a9f8000-7ffd8a9fa000 r-xp 00000000 00:00 0                          [vdso]
ffffffffff600000-ffffffffff601000 --xp 00000000 00:00 0                  [vsyscall]
";

    fn sample() -> Vec<MemoryRegion> {
        ProcMapsCatalog::parse_maps(Cursor::new(SAMPLE_MAPS)).unwrap()
    }

    #[test]
    fn parse_maps_test() {
        let regions = sample();
        assert_eq!(regions.len(), 10);

        let text = &regions[1];
        assert_eq!(text.start(), 0x55d0c0a02000);
        assert_eq!(text.end(), 0x55d0c0a07000);
        assert!(text.is_readable() && text.is_executable() && !text.is_writable());
        assert!(text.is_private());
        assert_eq!(text.file_offset_bytes(), 0x2000);
        assert_eq!(text.inode(), 1835012);
        assert_eq!(text.backing(), &Backing::File(PathBuf::from("/usr/bin/cat")));

        assert!(regions[2].is_heap());
        assert!(regions[3].is_anonymous());
        assert!(regions[4].has_no_access());
        assert!(!regions[5].is_private());
        assert_eq!(
            regions[5].backing(),
            &Backing::File(PathBuf::from("/dev/zero (deleted)"))
        );
        assert!(regions[6].is_stack());
        assert!(regions[7].is_pseudo_mapping());
        assert!(regions[9].is_pseudo_mapping());
    }

    #[test]
    fn parse_escaped_newline_test() {
        let line = "7f2b1c000000-7f2b1c001000 rw-p 00000000 08:01 77 /tmp/a\\012b\n";
        let regions = ProcMapsCatalog::parse_maps(Cursor::new(line)).unwrap();
        assert_eq!(regions[0].backing(), &Backing::File(PathBuf::from("/tmp/a\nb")));
    }

    #[test]
    fn other_escapes_are_kept_verbatim_test() {
        assert_eq!(ProcMapsCatalog::unescape("/tmp/a\\040b"), "/tmp/a\\040b");
        assert_eq!(ProcMapsCatalog::unescape("/tmp/x\\01"), "/tmp/x\\01");
        assert_eq!(ProcMapsCatalog::unescape("/tmp/y\\"), "/tmp/y\\");
    }

    #[test]
    fn parse_garbage_is_an_error_test() {
        let err = ProcMapsCatalog::parse_maps(Cursor::new("not a maps line\n")).unwrap_err();
        match err {
            HarnessError::Catalog(msg) => assert!(msg.starts_with("line 1")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn proc_self_maps_lists_a_stack_local_test() {
        let local = 0u64;
        let addr = &local as *const u64 as usize;
        let regions = ProcMapsCatalog::new().regions().unwrap();
        assert!(regions.iter().any(|r| r.contains_ptr(addr)));
    }

    #[test]
    fn policy_skips_pseudo_and_no_access_test() {
        let regions = sample();
        let selected = RegionPolicy::new().select(&regions);
        assert_eq!(selected.len(), 6);
        assert!(selected.iter().all(|r| !r.is_pseudo_mapping()));
        assert!(selected.iter().all(|r| !r.has_no_access()));
    }

    #[test]
    fn policy_excludes_scheduler_stack_and_code_test() {
        let regions = sample();
        let mut policy = RegionPolicy::new();
        policy
            .exclude_containing(0x7ffd8a9b0000, ExclusionReason::SchedulerStack)
            .exclude_containing(0x55d0c0a03000, ExclusionReason::HarnessCode);
        let classified = policy.classify(&regions);
        let verdict_of = |start: usize| {
            classified
                .iter()
                .find(|(r, _)| r.start() == start)
                .map(|(_, v)| *v)
                .unwrap()
        };
        assert_eq!(
            verdict_of(0x7ffd8a9a4000),
            Verdict::Excluded(ExclusionReason::SchedulerStack)
        );
        assert_eq!(
            verdict_of(0x55d0c0a02000),
            Verdict::Excluded(ExclusionReason::HarnessCode)
        );
        assert_eq!(verdict_of(0x55d0c1c39000), Verdict::Monitored);
        assert_eq!(policy.select(&regions).len(), 4);
    }

    #[test]
    fn policy_splits_around_private_ranges_test() {
        let ps = page_size();
        let base = 0x7f2b1c000000usize;
        let region = MemoryRegion::anonymous(
            MemoryRange::new_range(base, 8 * ps),
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        );
        let private = MemoryRange::new_range(base + 2 * ps, 3 * ps);
        let mut policy = RegionPolicy::new();
        policy.exclude_range(private, ExclusionReason::HarnessPrivate);

        let classified = policy.classify(&[region]);
        let ranges: Vec<(MemoryRange, Verdict)> =
            classified.iter().map(|(r, v)| (r.range(), *v)).collect();
        assert_eq!(
            ranges,
            vec![
                (MemoryRange::new_range(base, 2 * ps), Verdict::Monitored),
                (private, Verdict::Excluded(ExclusionReason::HarnessPrivate)),
                (
                    MemoryRange::new_range(base + 5 * ps, 3 * ps),
                    Verdict::Monitored
                ),
            ]
        );
        let selected = policy.select(&classified.into_iter().map(|(r, _)| r).collect::<Vec<_>>());
        assert!(selected.iter().all(|r| !r.intersects(&private)));
    }

    #[test]
    fn fixed_catalog_test() {
        let regions = sample();
        let mut catalog = FixedCatalog::new(regions.clone());
        assert_eq!(catalog.regions().unwrap().len(), regions.len());
    }
}
