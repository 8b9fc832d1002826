//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The name the hardlinks driver is registered under.
pub const DRIVER_NAME: &str = "hardlinks";

/// The sub directory of a layer holding its committed content.
pub const ROOT_SUBDIR: &str = "root";

/// The sub directory of a layer used as the bind mount target.
pub const MNT_SUBDIR: &str = "mnt";

/// The prefix of the scratch directory a diff is staged in before it is committed.
pub const TMP_ROOT_PREFIX: &str = "tmproot";

/// The backing filesystem reported in the driver status.
pub const BACKING_FS: &str = "<unknown>";

/// The status key the backing filesystem is reported under.
pub const BACKING_FS_STATUS_KEY: &str = "Backing Filesystem";

/// Layers whose id ends with this suffix are always mounted writable.
pub const INIT_LAYER_SUFFIX: &str = "-init";

/// The mode of the driver home and of each layer directory.
pub const LAYER_DIR_MODE: u32 = 0o700;

/// The mode of a freshly created `root/` or `mnt/`.
pub const LAYER_SUBDIR_MODE: u32 = 0o755;

/// The option key toggling read-only bind mounts.
pub const READONLY_MOUNTS_OPTION: &str = "hardlinks.readonly_mounts";
