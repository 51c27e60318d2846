use core::num::NonZeroU16;

use crate::IPPROTO_TCP;

pub trait RandomSource {
    fn next_u32(&mut self) -> u32;
}

impl<T: RandomSource + ?Sized> RandomSource for &mut T {
    #[inline(always)]
    fn next_u32(&mut self) -> u32 {
        (**self).next_u32()
    }
}

/// Picks a backend slot in `1..=count`.
///
/// TCP draws a random slot. Every other protocol resolves to slot 1 without
/// touching the random source so connectionless flows keep a stable backend.
#[inline(always)]
pub fn select_slot<R: RandomSource>(protocol: u32, count: NonZeroU16, rng: &mut R) -> u16 {
    if protocol != IPPROTO_TCP {
        return 1;
    }
    let rand = rng.next_u32();
    (rand % u32::from(count.get())) as u16 + 1
}
