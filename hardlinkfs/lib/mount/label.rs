//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Appends an SELinux `context` option for `mount_label` to a mount option string.
///
/// An empty label leaves the options untouched.
///
/// ## Examples
///
/// ```
/// use hardlinkfs::mount::format_mount_label;
///
/// assert_eq!(format_mount_label("bind", ""), "bind");
/// assert_eq!(
///     format_mount_label("bind", "system_u:object_r:container_file_t:s0"),
///     r#"bind,context="system_u:object_r:container_file_t:s0""#
/// );
/// assert_eq!(format_mount_label("", "label"), r#"context="label""#);
/// ```
pub fn format_mount_label(options: &str, mount_label: &str) -> String {
    match (options.is_empty(), mount_label.is_empty()) {
        (_, true) => options.to_string(),
        (true, false) => format!("context=\"{mount_label}\""),
        (false, false) => format!("{options},context=\"{mount_label}\""),
    }
}
