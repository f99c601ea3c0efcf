#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use otaverify::format::avb;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(footer) = avb::load_footer(data) {
                    if let Ok(header) = avb::load_vbmeta(data, &footer) {
                        let _ = header.verify();
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
