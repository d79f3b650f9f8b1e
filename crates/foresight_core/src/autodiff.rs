use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Dual number for forward-mode automatic differentiation.
///
/// `val` carries the primal value, `dot` the derivative with respect to the
/// seeded direction. Evaluating the residual function on `Dual` inputs with a
/// unit seed in one coordinate yields one column of the period Jacobian.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub dot: f64,
}

impl Dual {
    pub fn new(val: f64, dot: f64) -> Self {
        Self { val, dot }
    }

    /// A constant: derivative zero.
    pub fn constant(val: f64) -> Self {
        Self { val, dot: 0.0 }
    }

    /// A seeded variable: unit derivative.
    pub fn seeded(val: f64) -> Self {
        Self { val, dot: 1.0 }
    }
}

impl From<f64> for Dual {
    fn from(val: f64) -> Self {
        Self::constant(val)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.dot + rhs.dot)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.dot - rhs.dot)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.dot * rhs.val + self.val * rhs.dot)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        Self::new(
            self.val / rhs.val,
            (self.dot * rhs.val - self.val * rhs.dot) / (rhs.val * rhs.val),
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.dot)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // Derivative of rem w.r.t. the dividend is 1 almost everywhere.
        Self::new(self.val % rhs.val, self.dot)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for Dual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.dot == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::constant(-0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.dot)
    }
    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.dot } else { -self.dot },
        )
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        Self::new(
            self.val.powi(n),
            (n as f64) * self.val.powi(n - 1) * self.dot,
        )
    }

    fn powf(self, n: Self) -> Self {
        // d(x^y) = x^y * (y' ln x + y x'/x)
        let p = self.val.powf(n.val);
        Self::new(p, p * (n.dot * self.val.ln() + n.val * self.dot / self.val))
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        Self::new(s, self.dot / (2.0 * s))
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        Self::new(e, e * self.dot)
    }

    fn ln(self) -> Self {
        Self::new(self.val.ln(), self.dot / self.val)
    }

    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }

    fn log10(self) -> Self {
        Self::new(self.val.log10(), self.dot / (self.val * std::f64::consts::LN_10))
    }

    fn log2(self) -> Self {
        Self::new(self.val.log2(), self.dot / (self.val * std::f64::consts::LN_2))
    }

    fn exp2(self) -> Self {
        let e = self.val.exp2();
        Self::new(e, e * std::f64::consts::LN_2 * self.dot)
    }

    fn exp_m1(self) -> Self {
        Self::new(self.val.exp_m1(), self.val.exp() * self.dot)
    }

    fn ln_1p(self) -> Self {
        Self::new(self.val.ln_1p(), self.dot / (1.0 + self.val))
    }

    fn max(self, other: Self) -> Self {
        if self.val > other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val < other.val {
            self
        } else {
            other
        }
    }

    fn sin(self) -> Self {
        Self::new(self.val.sin(), self.dot * self.val.cos())
    }
    fn cos(self) -> Self {
        Self::new(self.val.cos(), -self.dot * self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        Self::new(t, self.dot * (1.0 + t * t))
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn sinh(self) -> Self {
        Self::new(self.val.sinh(), self.dot * self.val.cosh())
    }
    fn cosh(self) -> Self {
        Self::new(self.val.cosh(), self.dot * self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        Self::new(t, self.dot * (1.0 - t * t))
    }

    fn asin(self) -> Self {
        unimplemented!()
    }
    fn acos(self) -> Self {
        unimplemented!()
    }
    fn atan(self) -> Self {
        Self::new(self.val.atan(), self.dot / (1.0 + self.val * self.val))
    }
    fn atan2(self, _other: Self) -> Self {
        unimplemented!()
    }
    fn asinh(self) -> Self {
        unimplemented!()
    }
    fn acosh(self) -> Self {
        unimplemented!()
    }
    fn atanh(self) -> Self {
        unimplemented!()
    }
    fn abs_sub(self, _other: Self) -> Self {
        unimplemented!()
    }
    fn cbrt(self) -> Self {
        unimplemented!()
    }
    fn hypot(self, _other: Self) -> Self {
        unimplemented!()
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}
