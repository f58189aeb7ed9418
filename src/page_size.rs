use std::sync::OnceLock;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

pub fn get_page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Rounds down to the page containing `address`.
pub fn get_page_start(address: usize) -> usize {
    address & !(get_page_size() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = get_page_size();
        assert!(size >= 4096);
        assert_eq!(size & (size - 1), 0);
    }

    #[test]
    fn page_start_rounds_down() {
        let size = get_page_size();
        assert_eq!(get_page_start(size + 123), size);
        assert_eq!(get_page_start(size), size);
    }
}
