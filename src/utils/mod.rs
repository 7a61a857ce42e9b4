pub mod index_files;
pub mod sysinfo;
pub mod throttle;
