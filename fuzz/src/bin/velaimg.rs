#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use otaverify::format::velaimg;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = velaimg::load_header(data);
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
