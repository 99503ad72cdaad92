pub mod bins;
pub mod lock;
pub mod process;

pub mod naming {
    use std::path::PathBuf;

    pub const MAPPER_DIR: &str = "/dev/mapper";

    /// Device-mapper doubles every dash inside VG and LV names so the single
    /// dash between them stays unambiguous.
    #[inline]
    pub fn escape(name: &str) -> String {
        name.replace('-', "--")
    }

    /// Path of an LV as `findmnt` reports it, e.g. `/dev/mapper/main--vg-data--lv`.
    pub fn mapper_path(vg: &str, lv: &str) -> PathBuf {
        PathBuf::from(format!("{MAPPER_DIR}/{}-{}", escape(vg), escape(lv)))
    }

    /// `vg/lv` form accepted by the LVM tools.
    #[inline]
    pub fn lv_fq(vg: &str, lv: &str) -> String {
        format!("{vg}/{lv}")
    }

}
