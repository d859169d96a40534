use crate::common::*;

/// A height-width pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HW<T> {
    h: T,
    w: T,
}

impl<T> HW<T> {
    pub fn try_cast<U>(self) -> Option<HW<U>>
    where
        T: ToPrimitive,
        U: NumCast,
    {
        Some(HW {
            h: U::from(self.h)?,
            w: U::from(self.w)?,
        })
    }

    pub fn cast<U>(self) -> HW<U>
    where
        T: ToPrimitive,
        U: NumCast,
    {
        self.try_cast()
            .unwrap_or_else(|| panic!("size is not representable in the target type"))
    }
}

impl<T> HW<T>
where
    T: Num + PartialOrd + Copy,
{
    pub fn try_from_hw(hw: [T; 2]) -> Result<Self> {
        let [h, w] = hw;
        let zero = T::zero();
        ensure!(
            h > zero && w > zero,
            "height and width parameters must be positive"
        );
        Ok(Self { h, w })
    }

    pub fn area(&self) -> T {
        self.h * self.w
    }

    pub fn h(&self) -> T {
        self.h
    }

    pub fn w(&self) -> T {
        self.w
    }

    pub fn hw(&self) -> [T; 2] {
        [self.h, self.w]
    }
}

impl<T> TryFrom<[T; 2]> for HW<T>
where
    T: Num + PartialOrd + Copy,
{
    type Error = anyhow::Error;

    fn try_from(hw: [T; 2]) -> Result<Self> {
        Self::try_from_hw(hw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn size_area() -> Result<()> {
        let size = HW::try_from_hw([3.0, 2.0])?;
        let area: f64 = size.area();
        assert_abs_diff_eq!(area, 6.0);
        Ok(())
    }

    #[test]
    fn reject_empty_size() {
        assert!(HW::try_from_hw([0usize, 4]).is_err());
        assert!(HW::try_from_hw([4.0, -1.0]).is_err());
    }

    #[test]
    fn cast_size() -> Result<()> {
        let size: HW<f64> = HW::try_from_hw([480usize, 640])?.cast();
        assert_eq!(size.hw(), [480.0, 640.0]);
        Ok(())
    }
}
