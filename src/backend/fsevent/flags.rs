use std::fmt::{Display, Formatter};

use super::ffi as fs;

bitflags::bitflags! {
    /// Known `FSEvents` event flags.
    #[repr(C)]
    pub struct StreamFlags: u32 {
        const NONE = fs::kFSEventStreamEventFlagNone;
        const MUST_SCAN_SUBDIRS = fs::kFSEventStreamEventFlagMustScanSubDirs;
        const USER_DROPPED = fs::kFSEventStreamEventFlagUserDropped;
        const KERNEL_DROPPED = fs::kFSEventStreamEventFlagKernelDropped;
        const IDS_WRAPPED = fs::kFSEventStreamEventFlagEventIdsWrapped;
        const HISTORY_DONE = fs::kFSEventStreamEventFlagHistoryDone;
        const ROOT_CHANGED = fs::kFSEventStreamEventFlagRootChanged;
        const MOUNT = fs::kFSEventStreamEventFlagMount;
        const UNMOUNT = fs::kFSEventStreamEventFlagUnmount;
        const ITEM_CREATED = fs::kFSEventStreamEventFlagItemCreated;
        const ITEM_REMOVED = fs::kFSEventStreamEventFlagItemRemoved;
        const INODE_META_MOD = fs::kFSEventStreamEventFlagItemInodeMetaMod;
        const ITEM_RENAMED = fs::kFSEventStreamEventFlagItemRenamed;
        const ITEM_MODIFIED = fs::kFSEventStreamEventFlagItemModified;
        const FINDER_INFO_MOD = fs::kFSEventStreamEventFlagItemFinderInfoMod;
        const ITEM_CHANGE_OWNER = fs::kFSEventStreamEventFlagItemChangeOwner;
        const ITEM_XATTR_MOD = fs::kFSEventStreamEventFlagItemXattrMod;
        const IS_FILE = fs::kFSEventStreamEventFlagItemIsFile;
        const IS_DIR = fs::kFSEventStreamEventFlagItemIsDir;
        const IS_SYMLINK = fs::kFSEventStreamEventFlagItemIsSymlink;
        const OWN_EVENT = fs::kFSEventStreamEventFlagOwnEvent;
        const IS_HARDLINK = fs::kFSEventStreamEventFlagItemIsHardlink;
        const IS_LAST_HARDLINK = fs::kFSEventStreamEventFlagItemIsLastHardlink;
        const ITEM_CLONED = fs::kFSEventStreamEventFlagItemCloned;

        /// Native history was lost below the event path.
        const NEEDS_RESCAN = Self::MUST_SCAN_SUBDIRS.bits
            | Self::USER_DROPPED.bits
            | Self::KERNEL_DROPPED.bits
            | Self::ROOT_CHANGED.bits
            | Self::MOUNT.bits
            | Self::UNMOUNT.bits;
    }
}

const NAMES: &[(StreamFlags, &str)] = &[
    (StreamFlags::MUST_SCAN_SUBDIRS, "MUST_SCAN_SUBDIRS"),
    (StreamFlags::USER_DROPPED, "USER_DROPPED"),
    (StreamFlags::KERNEL_DROPPED, "KERNEL_DROPPED"),
    (StreamFlags::IDS_WRAPPED, "IDS_WRAPPED"),
    (StreamFlags::HISTORY_DONE, "HISTORY_DONE"),
    (StreamFlags::ROOT_CHANGED, "ROOT_CHANGED"),
    (StreamFlags::MOUNT, "MOUNT"),
    (StreamFlags::UNMOUNT, "UNMOUNT"),
    (StreamFlags::ITEM_CREATED, "ITEM_CREATED"),
    (StreamFlags::ITEM_REMOVED, "ITEM_REMOVED"),
    (StreamFlags::INODE_META_MOD, "INODE_META_MOD"),
    (StreamFlags::ITEM_RENAMED, "ITEM_RENAMED"),
    (StreamFlags::ITEM_MODIFIED, "ITEM_MODIFIED"),
    (StreamFlags::FINDER_INFO_MOD, "FINDER_INFO_MOD"),
    (StreamFlags::ITEM_CHANGE_OWNER, "ITEM_CHANGE_OWNER"),
    (StreamFlags::ITEM_XATTR_MOD, "ITEM_XATTR_MOD"),
    (StreamFlags::IS_FILE, "IS_FILE"),
    (StreamFlags::IS_DIR, "IS_DIR"),
    (StreamFlags::IS_SYMLINK, "IS_SYMLINK"),
    (StreamFlags::OWN_EVENT, "OWN_EVENT"),
    (StreamFlags::IS_HARDLINK, "IS_HARDLINK"),
    (StreamFlags::IS_LAST_HARDLINK, "IS_LAST_HARDLINK"),
    (StreamFlags::ITEM_CLONED, "ITEM_CLONED"),
];

impl Display for StreamFlags {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                write!(f, "{} ", name)?;
            }
        }
        Ok(())
    }
}
