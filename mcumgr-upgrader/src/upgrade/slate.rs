use std::sync::Arc;

/// Per-image progress record of a running upgrade.
///
/// The three progress flags are monotonic: they can only be raised, and the
/// setters keep `tested ⇒ uploaded` and `confirmed ⇒ uploaded` true.
#[derive(Debug, Clone)]
pub struct ImageSlate {
    image: u32,
    data: Arc<[u8]>,
    hash: [u8; 32],
    uploaded: bool,
    tested: bool,
    confirmed: bool,
}

impl ImageSlate {
    /// Creates a fresh slate with all progress flags cleared.
    pub fn new(image: u32, data: Arc<[u8]>, hash: [u8; 32]) -> Self {
        Self {
            image,
            data,
            hash,
            uploaded: false,
            tested: false,
            confirmed: false,
        }
    }

    /// The image (core) number this slate targets.
    pub fn image(&self) -> u32 {
        self.image
    }

    /// The firmware blob.
    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    /// The MCUboot identity hash of the firmware.
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Whether the image is present on the device.
    pub fn uploaded(&self) -> bool {
        self.uploaded
    }

    /// Whether the image has been marked for a test boot.
    pub fn tested(&self) -> bool {
        self.tested
    }

    /// Whether the device has accepted the image.
    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub(crate) fn mark_uploaded(&mut self) {
        self.uploaded = true;
    }

    pub(crate) fn mark_tested(&mut self) {
        self.uploaded = true;
        self.tested = true;
    }

    pub(crate) fn mark_confirmed(&mut self) {
        self.uploaded = true;
        self.confirmed = true;
    }

    /// Upload order key: image number first, then hash.
    pub(crate) fn sort_key(&self) -> (u32, [u8; 32]) {
        (self.image, self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slate(image: u32, hash: [u8; 32]) -> ImageSlate {
        ImageSlate::new(image, Arc::from([0u8; 4].as_slice()), hash)
    }

    #[test]
    fn flags_are_monotonic_and_imply_uploaded() {
        let mut s = slate(0, [1; 32]);
        assert!(!s.uploaded() && !s.tested() && !s.confirmed());

        s.mark_tested();
        assert!(s.uploaded() && s.tested());

        s.mark_confirmed();
        assert!(s.uploaded() && s.tested() && s.confirmed());
    }

    #[test]
    fn sort_key_orders_by_image_then_hash() {
        let a = slate(0, [9; 32]);
        let b = slate(1, [0; 32]);
        let c = slate(1, [1; 32]);

        let mut slates = vec![c.clone(), a.clone(), b.clone()];
        slates.sort_by_key(ImageSlate::sort_key);

        let keys: Vec<_> = slates.iter().map(ImageSlate::sort_key).collect();
        assert_eq!(keys, vec![a.sort_key(), b.sort_key(), c.sort_key()]);
    }
}
