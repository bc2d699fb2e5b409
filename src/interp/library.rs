//! Number-theory library exposed as `nt.<name>` and as bare globals
//!
//! Everything works on `i128`. Products that could overflow go through
//! `u128` modular multiplication; anything that still does not fit is an
//! `Overflow` error rather than a wrong answer.

use std::collections::HashMap;

use super::value::Value;
use super::ExecError;

/// Largest bound accepted by the sieve
const SIEVE_LIMIT: i128 = 10_000_000;
/// Largest modulus accepted by baby-step giant-step
const DLOG_LIMIT: i128 = 100_000_000_000_000;
/// Step budget when the base shares a factor with the modulus
const BRUTE_FORCE_LIMIT: u128 = 10_000_000;

pub const NAMES: [&str; 16] = [
    "is_prime",
    "primes",
    "prime_factors",
    "factor",
    "divisors",
    "totient",
    "gcd",
    "lcm",
    "egcd",
    "crt",
    "discrete_log",
    "fibonacci",
    "mod_inverse",
    "pow",
    "isqrt",
    "next_prime",
];

pub fn is_library(name: &str) -> bool {
    NAMES.contains(&name)
}

/// Dispatch a library call by name
pub fn call(name: &str, args: &[Value]) -> Result<Value, ExecError> {
    match name {
        "is_prime" => {
            let [n] = arity::<1>(name, args)?;
            Ok(Value::Bool(is_prime(n.as_int()?)))
        }
        "primes" => {
            let (low, high) = match args {
                [high] => (2, high.as_int()?),
                [low, Value::None] => (2, low.as_int()?),
                [low, high] => (low.as_int()?, high.as_int()?),
                _ => return Err(arity_error(name, "1 or 2", args.len())),
            };
            Ok(int_list(primes_between(low, high)?))
        }
        "prime_factors" => {
            let [n] = arity::<1>(name, args)?;
            Ok(int_list(prime_factors(positive(name, n.as_int()?)?)))
        }
        "factor" => {
            let [n] = arity::<1>(name, args)?;
            let pairs = factorize(positive(name, n.as_int()?)?)
                .into_iter()
                .map(|(p, e)| (Value::Int(p), Value::Int(i128::from(e))))
                .collect();
            Ok(Value::Dict(pairs))
        }
        "divisors" => {
            let [n] = arity::<1>(name, args)?;
            Ok(int_list(divisors(positive(name, n.as_int()?)?)?))
        }
        "totient" => {
            let [n] = arity::<1>(name, args)?;
            Ok(Value::Int(totient(positive(name, n.as_int()?)?)))
        }
        "gcd" => {
            let mut g = 0;
            for a in args {
                g = gcd(g, a.as_int()?);
            }
            // gcd(i128::MIN, 0) is 2**127
            if g < 0 {
                return Err(ExecError::Overflow);
            }
            Ok(Value::Int(g))
        }
        "lcm" => {
            let mut l = 1;
            for a in args {
                l = lcm(l, a.as_int()?)?;
            }
            Ok(Value::Int(l))
        }
        "egcd" => {
            let [a, b] = arity::<2>(name, args)?;
            let (g, x, y) = egcd(a.as_int()?, b.as_int()?)?;
            Ok(Value::Tuple(vec![Value::Int(g), Value::Int(x), Value::Int(y)]))
        }
        "crt" => {
            let [residues, moduli] = arity::<2>(name, args)?;
            let residues = ints(&residues)?;
            let moduli = ints(&moduli)?;
            Ok(crt(&residues, &moduli)?.map_or(Value::None, Value::Int))
        }
        "discrete_log" => {
            let [target, base, modulus] = arity::<3>(name, args)?;
            Ok(discrete_log(target.as_int()?, base.as_int()?, modulus.as_int()?)?
                .map_or(Value::None, Value::Int))
        }
        "fibonacci" => {
            let [n] = arity::<1>(name, args)?;
            Ok(Value::Int(fibonacci(n.as_int()?)?))
        }
        "mod_inverse" => {
            let [a, m] = arity::<2>(name, args)?;
            Ok(Value::Int(mod_inverse(a.as_int()?, m.as_int()?)?))
        }
        "pow" => match args {
            [base, exp] | [base, exp, Value::None] => super::eval::binary_pow(base, exp),
            [base, exp, modulus] => Ok(Value::Int(pow_mod(
                base.as_int()?,
                exp.as_int()?,
                modulus.as_int()?,
            )?)),
            _ => Err(arity_error(name, "2 or 3", args.len())),
        },
        "isqrt" => {
            let [n] = arity::<1>(name, args)?;
            let n = n.as_int()?;
            if n < 0 {
                return Err(ExecError::Value("isqrt() argument must be nonnegative".into()));
            }
            Ok(Value::Int(isqrt(n)))
        }
        "next_prime" => {
            let [n] = arity::<1>(name, args)?;
            let mut c = n.as_int()?.max(1).checked_add(1).ok_or(ExecError::Overflow)?;
            while !is_prime(c) {
                c = c.checked_add(1).ok_or(ExecError::Overflow)?;
            }
            Ok(Value::Int(c))
        }
        other => Err(ExecError::Name(other.to_string())),
    }
}

fn arity<const N: usize>(name: &str, args: &[Value]) -> Result<[Value; N], ExecError> {
    <[Value; N]>::try_from(args.to_vec())
        .map_err(|_| arity_error(name, &N.to_string(), args.len()))
}

fn arity_error(name: &str, expected: &str, got: usize) -> ExecError {
    ExecError::Type(format!(
        "{}() takes {} positional argument(s) but {} were given",
        name, expected, got
    ))
}

fn positive(name: &str, n: i128) -> Result<i128, ExecError> {
    if n < 1 {
        Err(ExecError::Value(format!("{}() requires a positive integer, got {}", name, n)))
    } else {
        Ok(n)
    }
}

fn ints(v: &Value) -> Result<Vec<i128>, ExecError> {
    v.iter_items()?.iter().map(Value::as_int).collect()
}

fn int_list(v: Vec<i128>) -> Value {
    Value::List(v.into_iter().map(Value::Int).collect())
}

pub fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.unsigned_abs(), b.unsigned_abs());
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a as i128
}

pub fn lcm(a: i128, b: i128) -> Result<i128, ExecError> {
    if a == 0 || b == 0 {
        return Ok(0);
    }
    (a / gcd(a, b))
        .checked_mul(b)
        .and_then(i128::checked_abs)
        .ok_or(ExecError::Overflow)
}

/// (g, x, y) with a*x + b*y = g
pub fn egcd(a: i128, b: i128) -> Result<(i128, i128, i128), ExecError> {
    let (mut old_r, mut r) = (a, b);
    let (mut old_s, mut s) = (1i128, 0i128);
    let (mut old_t, mut t) = (0i128, 1i128);
    let step = |old: i128, q: i128, cur: i128| {
        q.checked_mul(cur)
            .and_then(|qc| old.checked_sub(qc))
            .ok_or(ExecError::Overflow)
    };
    while r != 0 {
        let q = old_r.checked_div_euclid(r).ok_or(ExecError::Overflow)?;
        let rem = old_r.checked_rem_euclid(r).ok_or(ExecError::Overflow)?;
        (old_r, r) = (r, rem);
        (old_s, s) = (s, step(old_s, q, s)?);
        (old_t, t) = (t, step(old_t, q, t)?);
    }
    if old_r < 0 {
        let neg = |v: i128| v.checked_neg().ok_or(ExecError::Overflow);
        return Ok((neg(old_r)?, neg(old_s)?, neg(old_t)?));
    }
    Ok((old_r, old_s, old_t))
}

pub fn mod_inverse(a: i128, m: i128) -> Result<i128, ExecError> {
    if m == 0 {
        return Err(ExecError::ZeroDivision);
    }
    let (g, x, _) = egcd(a.rem_euclid(m), m)?;
    if g != 1 {
        return Err(ExecError::Value("base is not invertible for the given modulus".into()));
    }
    // Nonnegative and below |m| for either sign of m
    x.checked_rem_euclid(m).ok_or(ExecError::Overflow)
}

fn mul_mod(a: u128, b: u128, m: u128) -> u128 {
    if m <= u64::MAX as u128 {
        return (a % m) * (b % m) % m;
    }
    let (mut a, mut b) = (a % m, b % m);
    let mut result = 0u128;
    while b > 0 {
        if b & 1 == 1 {
            result = add_mod(result, a, m);
        }
        a = add_mod(a, a, m);
        b >>= 1;
    }
    result
}

fn add_mod(a: u128, b: u128, m: u128) -> u128 {
    if a >= m - b {
        a - (m - b)
    } else {
        a + b
    }
}

fn pow_mod_u(mut base: u128, mut exp: u128, m: u128) -> u128 {
    if m == 1 {
        return 0;
    }
    let mut result = 1u128;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, m);
        }
        base = mul_mod(base, base, m);
        exp >>= 1;
    }
    result
}

pub fn pow_mod(base: i128, exp: i128, modulus: i128) -> Result<i128, ExecError> {
    if modulus == 0 {
        return Err(ExecError::Value("pow() 3rd argument cannot be 0".into()));
    }
    let m = modulus.unsigned_abs();
    if m == 1 {
        return Ok(0);
    }
    let base = if exp < 0 { mod_inverse(base, modulus)? } else { base };
    // rem_euclid is nonnegative for either sign of modulus
    let r = pow_mod_u(base.rem_euclid(modulus) as u128, exp.unsigned_abs(), m) as i128;
    // Python: result takes the sign of the modulus
    Ok(if modulus < 0 && r != 0 { r + modulus } else { r })
}

/// Miller-Rabin with the first thirteen primes as witnesses;
/// deterministic below 3.3e24
pub fn is_prime(n: i128) -> bool {
    if n < 2 {
        return false;
    }
    const WITNESSES: [u128; 13] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41];
    let n = n as u128;
    for p in WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }
    let mut d = n - 1;
    let mut s = 0;
    while d % 2 == 0 {
        d /= 2;
        s += 1;
    }
    'witness: for a in WITNESSES {
        let mut x = pow_mod_u(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..s {
            x = mul_mod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

pub fn primes_between(low: i128, high: i128) -> Result<Vec<i128>, ExecError> {
    if high > SIEVE_LIMIT {
        return Err(ExecError::Value(format!(
            "primes() upper bound {} exceeds the sieve limit {}",
            high, SIEVE_LIMIT
        )));
    }
    if high < 2 || high < low {
        return Ok(Vec::new());
    }
    let high = high as usize;
    let mut sieve = vec![true; high + 1];
    sieve[0] = false;
    sieve[1] = false;
    let mut i = 2;
    while i * i <= high {
        if sieve[i] {
            let mut j = i * i;
            while j <= high {
                sieve[j] = false;
                j += i;
            }
        }
        i += 1;
    }
    let low = low.max(0) as usize;
    Ok(sieve
        .iter()
        .enumerate()
        .skip(low)
        .filter(|(_, p)| **p)
        .map(|(i, _)| i as i128)
        .collect())
}

pub fn isqrt(n: i128) -> i128 {
    if n < 2 {
        return n;
    }
    let mut x = (n as f64).sqrt() as i128;
    while x.checked_mul(x).map_or(true, |sq| sq > n) {
        x -= 1;
    }
    while (x + 1).checked_mul(x + 1).is_some_and(|sq| sq <= n) {
        x += 1;
    }
    x
}

/// Brent's variant of Pollard's rho; `n` must be odd and composite
fn pollard_rho(n: u128) -> u128 {
    let mut c = 1u128;
    loop {
        let f = |x: u128| add_mod(mul_mod(x, x, n), c % n, n);
        let (mut x, mut y, mut g) = (2u128, 2u128, 1u128);
        while g == 1 {
            x = f(x);
            y = f(f(y));
            let diff = x.abs_diff(y);
            g = gcd(diff as i128, n as i128) as u128;
        }
        if g != n {
            return g;
        }
        c += 1;
    }
}

fn collect_factors(n: u128, out: &mut Vec<u128>) {
    if n == 1 {
        return;
    }
    if is_prime(n as i128) {
        out.push(n);
        return;
    }
    let d = pollard_rho(n);
    collect_factors(d, out);
    collect_factors(n / d, out);
}

/// Prime factors with multiplicity, ascending
pub fn prime_factors(n: i128) -> Vec<i128> {
    let mut n = n.unsigned_abs();
    let mut out = Vec::new();
    for p in [2u128, 3, 5, 7, 11, 13] {
        while n % p == 0 {
            out.push(p);
            n /= p;
        }
    }
    let mut p = 17u128;
    while p * p <= n && p < 10_000 {
        while n % p == 0 {
            out.push(p);
            n /= p;
        }
        p += 2;
    }
    collect_factors(n, &mut out);
    out.sort_unstable();
    out.into_iter().map(|p| p as i128).collect()
}

pub fn factorize(n: i128) -> Vec<(i128, u32)> {
    let mut out: Vec<(i128, u32)> = Vec::new();
    for p in prime_factors(n) {
        match out.last_mut() {
            Some((q, e)) if *q == p => *e += 1,
            _ => out.push((p, 1)),
        }
    }
    out
}

pub fn divisors(n: i128) -> Result<Vec<i128>, ExecError> {
    let mut divs = vec![1i128];
    for (p, e) in factorize(n) {
        let mut next = Vec::with_capacity(divs.len() * (e as usize + 1));
        for d in &divs {
            let mut pk = 1i128;
            for _ in 0..=e {
                next.push(d.checked_mul(pk).ok_or(ExecError::Overflow)?);
                pk = pk.checked_mul(p).ok_or(ExecError::Overflow)?;
            }
        }
        divs = next;
    }
    divs.sort_unstable();
    Ok(divs)
}

pub fn totient(n: i128) -> i128 {
    factorize(n)
        .into_iter()
        .fold(n, |acc, (p, _)| acc / p * (p - 1))
}

/// Solve x = r_i (mod m_i); `None` when the system is inconsistent
pub fn crt(residues: &[i128], moduli: &[i128]) -> Result<Option<i128>, ExecError> {
    if residues.len() != moduli.len() {
        return Err(ExecError::Value(
            "crt() needs as many residues as moduli".into(),
        ));
    }
    let (mut x, mut m) = (0i128, 1i128);
    for (&r, &mi) in residues.iter().zip(moduli) {
        if mi <= 0 {
            return Err(ExecError::Value("crt() moduli must be positive".into()));
        }
        let (g, p, _) = egcd(m, mi)?;
        let diff = r.checked_sub(x).ok_or(ExecError::Overflow)?;
        if diff.rem_euclid(g) != 0 {
            return Ok(None);
        }
        let step = mi / g;
        let k = mul_mod_signed(diff / g, p, step)?;
        let l = m.checked_mul(step).ok_or(ExecError::Overflow)?;
        x = m
            .checked_mul(k)
            .and_then(|mk| x.checked_add(mk))
            .ok_or(ExecError::Overflow)?
            .rem_euclid(l);
        m = l;
    }
    Ok(Some(x.rem_euclid(m)))
}

fn mul_mod_signed(a: i128, b: i128, m: i128) -> Result<i128, ExecError> {
    if m == 1 {
        return Ok(0);
    }
    let a = a.rem_euclid(m) as u128;
    let b = b.rem_euclid(m) as u128;
    Ok(mul_mod(a, b, m as u128) as i128)
}

/// Smallest x >= 0 with base^x = target (mod modulus)
pub fn discrete_log(target: i128, base: i128, modulus: i128) -> Result<Option<i128>, ExecError> {
    if modulus <= 0 {
        return Err(ExecError::Value("discrete_log() modulus must be positive".into()));
    }
    if modulus > DLOG_LIMIT {
        return Err(ExecError::Value(format!(
            "discrete_log() modulus exceeds {}",
            DLOG_LIMIT
        )));
    }
    if modulus == 1 {
        return Ok(Some(0));
    }
    let m = modulus as u128;
    let target = target.rem_euclid(modulus) as u128;
    let base = base.rem_euclid(modulus) as u128;

    if gcd(base as i128, modulus) != 1 {
        // No inverse for the giant steps; walk the powers directly
        let mut e = 1u128;
        for x in 0..m.min(BRUTE_FORCE_LIMIT) {
            if e == target {
                return Ok(Some(x as i128));
            }
            e = mul_mod(e, base, m);
        }
        return Ok(None);
    }

    let n = (isqrt(modulus) + 1) as u128;
    let mut baby = HashMap::new();
    let mut e = 1u128;
    for j in 0..n {
        baby.entry(e).or_insert(j);
        e = mul_mod(e, base, m);
    }

    let giant_inv = mod_inverse(pow_mod_u(base, n, m) as i128, modulus)? as u128;
    let mut want = target;
    for i in 0..=n {
        if let Some(j) = baby.get(&want) {
            return Ok(Some((i * n + j) as i128));
        }
        want = mul_mod(want, giant_inv, m);
    }
    Ok(None)
}

/// F(0) = 0, F(1) = 1, via fast doubling
pub fn fibonacci(n: i128) -> Result<i128, ExecError> {
    if n < 0 {
        return Err(ExecError::Value("fibonacci() index must be nonnegative".into()));
    }
    fn pair(n: u128) -> Result<(i128, i128), ExecError> {
        if n == 0 {
            return Ok((0, 1));
        }
        let (a, b) = pair(n / 2)?;
        let two_b = b.checked_mul(2).ok_or(ExecError::Overflow)?;
        let c = a.checked_mul(two_b - a).ok_or(ExecError::Overflow)?;
        let d = a
            .checked_mul(a)
            .and_then(|aa| b.checked_mul(b).and_then(|bb| aa.checked_add(bb)))
            .ok_or(ExecError::Overflow)?;
        if n % 2 == 0 {
            Ok((c, d))
        } else {
            Ok((d, c.checked_add(d).ok_or(ExecError::Overflow)?))
        }
    }
    pair(n as u128).map(|(f, _)| f)
}
