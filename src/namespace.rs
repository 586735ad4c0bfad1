//! In-process device namespace: device numbers, classes and named nodes.
//!
//! This is where a device "becomes reachable under a stable name". Startup
//! goes through four steps, each with an inverse:
//!
//! | Step | Acquire | Release |
//! |------|---------|---------|
//! | 1 | [`alloc_region`](Namespace::alloc_region) / [`register_region`](Namespace::register_region) | [`unregister_region`](Namespace::unregister_region) |
//! | 2 | [`create_class`](Namespace::create_class) | [`destroy_class`](Namespace::destroy_class) |
//! | 3 | [`create_node`](Namespace::create_node) | [`destroy_node`](Namespace::destroy_node) |
//! | 4 | [`bind`](Namespace::bind) | [`unbind`](Namespace::unbind) |
//!
//! Only a bound node can be opened.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrayvec::ArrayVec;
use spin::{Mutex, RwLock};

use crate::error::{DevError, DevResult};
use crate::file::{CharDeviceOps, OpenFlags, Session};

/// Maximum number of device-number regions held at once.
pub const MAX_REGIONS: usize = 16;

/// Dynamic majors are handed out from the top of this range downwards.
pub const DYNAMIC_MAJOR_LAST: u32 = 254;
pub const DYNAMIC_MAJOR_FIRST: u32 = 234;

/// A device number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DevNum {
    pub major: u32,
    pub minor: u32,
}

impl DevNum {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl core::fmt::Display for DevNum {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone)]
struct Region {
    major: u32,
    first_minor: u32,
    count: u32,
    name: String,
}

impl Region {
    fn overlaps(&self, major: u32, first_minor: u32, count: u32) -> bool {
        let (start, end) = minor_span(first_minor, count);
        let (own_start, own_end) = minor_span(self.first_minor, self.count);
        self.major == major && start < own_end && own_start < end
    }
}

/// Half-open minor range, widened so `u32::MAX + count` cannot wrap.
#[inline]
fn minor_span(first_minor: u32, count: u32) -> (u64, u64) {
    (first_minor as u64, first_minor as u64 + count as u64)
}

fn check_minors(first_minor: u32, count: u32) -> DevResult {
    if count == 0 {
        return dev_err!(InvalidInput, "empty device number region");
    }
    if first_minor.checked_add(count).is_none() {
        return dev_err!(
            InvalidInput,
            format!("minor range {first_minor} (+{count}) overflows")
        );
    }
    Ok(())
}

struct Node {
    devnum: DevNum,
    class: String,
    ops: Option<Arc<dyn CharDeviceOps>>,
}

/// Registry of device numbers, classes and nodes.
///
/// Lookups take read locks. Registration and teardown take write locks on
/// one table at a time.
pub struct Namespace {
    regions: Mutex<ArrayVec<Region, MAX_REGIONS>>,
    classes: RwLock<BTreeSet<String>>,
    nodes: RwLock<BTreeMap<String, Node>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(ArrayVec::new()),
            classes: RwLock::new(BTreeSet::new()),
            nodes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Allocates a free dynamic major and reserves `count` minors from `first_minor`.
    pub fn alloc_region(&self, first_minor: u32, count: u32, name: &str) -> DevResult<DevNum> {
        check_minors(first_minor, count)?;
        let mut regions = self.regions.lock();
        if regions.is_full() {
            return dev_err!(AllocationFailure, "device number table is full");
        }

        let major = (DYNAMIC_MAJOR_FIRST..=DYNAMIC_MAJOR_LAST)
            .rev()
            .find(|&major| regions.iter().all(|r| r.major != major))
            .ok_or_else(|| dev_err_type!(AllocationFailure, "no free dynamic major"))?;

        regions.push(Region {
            major,
            first_minor,
            count,
            name: String::from(name),
        });
        info!("namespace: allocated major {} for {}", major, name);
        Ok(DevNum::new(major, first_minor))
    }

    /// Reserves a caller-chosen region.
    pub fn register_region(&self, first: DevNum, count: u32, name: &str) -> DevResult {
        check_minors(first.minor, count)?;
        let mut regions = self.regions.lock();
        if regions
            .iter()
            .any(|r| r.overlaps(first.major, first.minor, count))
        {
            return dev_err!(
                RegistrationFailure,
                format!("device numbers {first} (+{count}) already in use")
            );
        }
        if regions.is_full() {
            return dev_err!(AllocationFailure, "device number table is full");
        }

        regions.push(Region {
            major: first.major,
            first_minor: first.minor,
            count,
            name: String::from(name),
        });
        info!("namespace: registered {} (+{}) for {}", first, count, name);
        Ok(())
    }

    /// Releases a region. Unknown regions are ignored.
    pub fn unregister_region(&self, first: DevNum, count: u32) {
        let mut regions = self.regions.lock();
        if let Some(index) = regions
            .iter()
            .position(|r| r.major == first.major && r.first_minor == first.minor && r.count == count)
        {
            let region = regions.remove(index);
            debug!("namespace: released {} ({})", first, region.name);
        }
    }

    pub fn create_class(&self, name: &str) -> DevResult {
        if !self.classes.write().insert(String::from(name)) {
            return dev_err!(RegistrationFailure, format!("class {name} already exists"));
        }
        debug!("namespace: created class {}", name);
        Ok(())
    }

    pub fn destroy_class(&self, name: &str) {
        if self.classes.write().remove(name) {
            debug!("namespace: destroyed class {}", name);
        }
    }

    /// Publishes a node. The class must exist and the number must be registered.
    pub fn create_node(&self, class: &str, devnum: DevNum, name: &str) -> DevResult {
        if !self.classes.read().contains(class) {
            return dev_err!(RegistrationFailure, format!("class {class} does not exist"));
        }
        if !self
            .regions
            .lock()
            .iter()
            .any(|r| r.overlaps(devnum.major, devnum.minor, 1))
        {
            return dev_err!(RegistrationFailure, format!("device number {devnum} not registered"));
        }

        let mut nodes = self.nodes.write();
        if nodes.contains_key(name) {
            return dev_err!(RegistrationFailure, format!("node {name} already exists"));
        }
        nodes.insert(
            String::from(name),
            Node {
                devnum,
                class: String::from(class),
                ops: None,
            },
        );
        info!("namespace: created node {} ({}) in class {}", name, devnum, class);
        Ok(())
    }

    pub fn destroy_node(&self, name: &str) {
        if let Some(node) = self.nodes.write().remove(name) {
            debug!("namespace: destroyed node {} ({}) in class {}", name, node.devnum, node.class);
        }
    }

    /// Attaches the operations that serve opens of `name`.
    pub fn bind(&self, name: &str, ops: Arc<dyn CharDeviceOps>) -> DevResult {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| dev_err_type!(NotFound, name))?;
        if node.ops.is_some() {
            return dev_err!(RegistrationFailure, format!("node {name} is already bound"));
        }
        node.ops = Some(ops);
        debug!("namespace: bound {}", name);
        Ok(())
    }

    /// Detaches the operations of `name`. Existing sessions keep working.
    pub fn unbind(&self, name: &str) {
        if let Some(node) = self.nodes.write().get_mut(name) {
            if node.ops.take().is_some() {
                debug!("namespace: unbound {}", name);
            }
        }
    }

    /// Opens a new session on the device bound under `name`.
    pub fn open(&self, name: &str, flags: OpenFlags) -> DevResult<Session> {
        let ops = self
            .nodes
            .read()
            .get(name)
            .and_then(|node| node.ops.clone())
            .ok_or_else(|| DevError::NotFound(String::from(name)))?;
        Session::open(ops, flags)
    }

    /// Device number of the node published under `name`.
    pub fn lookup(&self, name: &str) -> Option<DevNum> {
        self.nodes.read().get(name).map(|node| node.devnum)
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.nodes
            .read()
            .get(name)
            .is_some_and(|node| node.ops.is_some())
    }

    pub fn has_class(&self, name: &str) -> bool {
        self.classes.read().contains(name)
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Namespace")
            .field("regions", &self.region_count())
            .field("classes", &self.classes.read().len())
            .field("nodes", &self.node_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileContext;

    struct NullDevice;

    impl CharDeviceOps for NullDevice {
        fn read(&self, _file: &FileContext, _buf: &mut [u8]) -> DevResult<usize> {
            Ok(0)
        }

        fn write(&self, _file: &FileContext, buf: &[u8]) -> DevResult<usize> {
            Ok(buf.len())
        }

        fn ioctl(&self, _file: &FileContext, _cmd: u32, _arg: usize) -> DevResult<usize> {
            Err(DevError::NotSupported)
        }
    }

    #[test]
    fn test_dynamic_majors_are_distinct() {
        let ns = Namespace::new();
        let a = ns.alloc_region(0, 1, "a").unwrap();
        let b = ns.alloc_region(0, 1, "b").unwrap();
        assert_eq!(a.major, DYNAMIC_MAJOR_LAST);
        assert_ne!(a.major, b.major);
        assert_eq!(ns.region_count(), 2);

        ns.unregister_region(a, 1);
        assert_eq!(ns.region_count(), 1);
        // The freed major is handed out again.
        assert_eq!(ns.alloc_region(0, 1, "c").unwrap().major, DYNAMIC_MAJOR_LAST);
    }

    #[test]
    fn test_region_table_exhaustion() {
        let ns = Namespace::new();
        for i in 0..MAX_REGIONS {
            ns.register_region(DevNum::new(10, i as u32), 1, "fill").unwrap();
        }
        assert!(matches!(
            ns.alloc_region(0, 1, "late"),
            Err(DevError::AllocationFailure(_))
        ));
    }

    #[test]
    fn test_fixed_region_conflict() {
        let ns = Namespace::new();
        ns.register_region(DevNum::new(240, 0), 4, "first").unwrap();
        assert!(matches!(
            ns.register_region(DevNum::new(240, 2), 1, "second"),
            Err(DevError::RegistrationFailure(_))
        ));
        ns.register_region(DevNum::new(240, 4), 1, "adjacent").unwrap();
    }

    #[test]
    fn test_minor_range_at_top_of_space() {
        let ns = Namespace::new();
        assert!(matches!(
            ns.register_region(DevNum::new(1, u32::MAX), 1, "last"),
            Err(DevError::InvalidInput(_))
        ));
        assert!(matches!(
            ns.register_region(DevNum::new(1, u32::MAX), 2, "wraps"),
            Err(DevError::InvalidInput(_))
        ));
        assert!(matches!(
            ns.alloc_region(u32::MAX, 2, "wraps"),
            Err(DevError::InvalidInput(_))
        ));
        assert_eq!(ns.region_count(), 0);

        // A region ending exactly at the top stays comparable with others.
        ns.register_region(DevNum::new(1, u32::MAX - 1), 1, "top").unwrap();
        ns.register_region(DevNum::new(1, 0), 1, "bottom").unwrap();
        assert!(matches!(
            ns.register_region(DevNum::new(1, u32::MAX - 1), 1, "again"),
            Err(DevError::RegistrationFailure(_))
        ));
        let devnum = DevNum::new(1, u32::MAX - 1);
        ns.create_class("edge").unwrap();
        ns.create_node("edge", devnum, "edge").unwrap();
        assert_eq!(ns.lookup("edge"), Some(devnum));
    }

    #[test]
    fn test_node_requires_class_and_region() {
        let ns = Namespace::new();
        let devnum = DevNum::new(240, 0);

        assert!(ns.create_node("chardev", devnum, "userspace").is_err());
        ns.create_class("chardev").unwrap();
        assert!(ns.create_node("chardev", devnum, "userspace").is_err());
        ns.register_region(devnum, 1, "userspace").unwrap();
        ns.create_node("chardev", devnum, "userspace").unwrap();

        assert_eq!(ns.lookup("userspace"), Some(devnum));
        assert!(matches!(
            ns.create_node("chardev", devnum, "userspace"),
            Err(DevError::RegistrationFailure(_))
        ));
    }

    #[test]
    fn test_open_needs_binding() {
        let ns = Namespace::new();
        let devnum = ns.alloc_region(0, 1, "null").unwrap();
        ns.create_class("mem").unwrap();
        ns.create_node("mem", devnum, "null").unwrap();

        assert!(matches!(
            ns.open("null", OpenFlags::BLOCKING),
            Err(DevError::NotFound(_))
        ));

        ns.bind("null", Arc::new(NullDevice)).unwrap();
        assert!(ns.is_bound("null"));
        let session = ns.open("null", OpenFlags::BLOCKING).unwrap();
        assert_eq!(session.write(b"abc"), Ok(3));

        ns.unbind("null");
        assert!(ns.open("null", OpenFlags::BLOCKING).is_err());
        // An already-open session outlives the binding.
        assert_eq!(session.write(b"x"), Ok(1));
        session.close();
    }

    #[test]
    fn test_release_is_idempotent() {
        let ns = Namespace::new();
        let devnum = ns.alloc_region(0, 1, "x").unwrap();
        ns.create_class("c").unwrap();
        ns.create_node("c", devnum, "x").unwrap();

        for _ in 0..2 {
            ns.unbind("x");
            ns.destroy_node("x");
            ns.destroy_class("c");
            ns.unregister_region(devnum, 1);
        }
        assert_eq!(ns.region_count(), 0);
        assert_eq!(ns.node_count(), 0);
        assert!(!ns.has_class("c"));
    }
}
