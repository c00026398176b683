//! System resource probing
//!
//! Cheap estimate of free memory, used only to explain allocation failures.

/// Bytes of memory the OS reports as available, if it can be determined
pub fn available_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|s| parse_mem_available(&s))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Extracts `MemAvailable` (reported in kB) from `/proc/meminfo` text
pub fn parse_mem_available(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
