// Deterministic helpers shared by the unit tests.

use sha2::Digest;

use crate::provider::{HashAlgorithm, Hasher, HasherFactory};

#[derive(Clone, Default)]
struct Sha256Hasher {
    inner: sha2::Sha256,
}

impl Hasher for Sha256Hasher {
    fn block_size(&self) -> usize {
        64
    }

    fn output_size(&self) -> usize {
        32
    }

    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finish(&self) -> Vec<u8> {
        self.inner.clone().finalize().to_vec()
    }

    fn box_clone(&self) -> Box<dyn Hasher> {
        Box::new(self.clone())
    }
}

#[derive(Clone, Default)]
struct Sha384Hasher {
    inner: sha2::Sha384,
}

impl Hasher for Sha384Hasher {
    fn block_size(&self) -> usize {
        128
    }

    fn output_size(&self) -> usize {
        48
    }

    fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    fn finish(&self) -> Vec<u8> {
        self.inner.clone().finalize().to_vec()
    }

    fn box_clone(&self) -> Box<dyn Hasher> {
        Box::new(self.clone())
    }
}

pub fn sha256_factory() -> HasherFactory {
    HasherFactory::new(HashAlgorithm::Sha256, || Box::new(Sha256Hasher::default()))
}

pub fn sha384_factory() -> HasherFactory {
    HasherFactory::new(HashAlgorithm::Sha384, || Box::new(Sha384Hasher::default()))
}
