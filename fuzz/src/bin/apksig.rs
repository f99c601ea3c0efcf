#[cfg(not(windows))]
mod fuzz {
    use honggfuzz::fuzz;
    use otaverify::format::apksig::{self, PackageSignature};

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                // Whole signing blocks.
                let _ = PackageSignature::from_signing_block(data);

                // Package layouts with no comment.
                if let Ok(app_block) = apksig::locate(data, 0) {
                    if let Ok(block) = apksig::read_signing_block(data, &app_block) {
                        let _ = PackageSignature::from_signing_block(&block);
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
