use proc_macro2::{Span, TokenStream};
use quote::quote;
use syn::{
    Expr, GenericArgument, ItemFn, Lit, LitFloat, LitStr, PathArguments, Result, ReturnType, Type,
    parse::{Parse, ParseStream},
    parse_quote, parse2,
};

pub fn timeout(attr: TokenStream, item: TokenStream) -> Result<TokenStream> {
    let attr: TimeoutArgs = parse2(attr)?;
    let mut func: ItemFn = parse2(item)?;

    let duration = attr.into_duration_expr()?;
    let block = func.block;
    let run = if func.sig.asyncness.is_some() {
        quote!(::statetree::utils::timer::with_timeout_async(async move #block, __duration).await)
    } else {
        quote!(::statetree::utils::timer::with_timeout(move || #block, __duration))
    };
    let on_timeout = if returns_result(&func.sig.output) {
        quote!(return ::core::result::Result::Err(::core::convert::Into::into(e)))
    } else {
        quote!(panic!("{e}"))
    };
    let wrapped: TokenStream = quote!({
        let __duration =
            ::statetree::utils::timer::IntoTimeoutDuration::into_timeout_duration(#duration);
        match #run {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(e) => #on_timeout,
        }
    });
    func.block = Box::new(parse_quote!(#wrapped));
    Ok(quote!(#func))
}

struct TimeoutArgs {
    duration: Expr,
}

impl Parse for TimeoutArgs {
    fn parse(input: ParseStream) -> Result<Self> {
        if input.is_empty() {
            bail!(_, "timeout duration is required");
        }
        let duration: Expr = input.parse()?;
        if !input.is_empty() {
            bail!(_, "expected a single duration expression");
        }
        Ok(Self { duration })
    }
}

impl TimeoutArgs {
    fn into_duration_expr(self) -> Result<TokenStream> {
        match self.duration {
            Expr::Lit(expr_lit) => match expr_lit.lit {
                Lit::Str(lit) => duration_from_literal(&lit),
                _ => Ok(quote!(#expr_lit)),
            },
            expr => Ok(quote!(#expr)),
        }
    }
}

fn returns_result(output: &ReturnType) -> bool {
    let ReturnType::Type(_, ty) = output else {
        return false;
    };
    let Type::Path(type_path) = ty.as_ref() else {
        return false;
    };
    let Some(segment) = type_path.path.segments.last() else {
        return false;
    };
    if segment.ident != "Result" {
        return false;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return false;
    };
    args.args
        .iter()
        .filter(|arg| matches!(arg, GenericArgument::Type(_)))
        .count()
        == 2
}

fn duration_from_literal(lit: &LitStr) -> Result<TokenStream> {
    let raw = lit.value();
    let s = raw.trim();
    let (number, to_secs): (&str, fn(f64) -> f64) = if let Some(n) = s.strip_suffix("ms") {
        (n, |v| v / 1000.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, |v| v)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, |v| v * 60.0)
    } else {
        bail!(lit.span(), "invalid duration literal `{raw}`, expected a `ms`, `s` or `m` suffix");
    };
    let value: f64 = match number.trim().parse() {
        Ok(value) => value,
        Err(_) => bail!(lit.span(), "invalid duration number `{number}`"),
    };
    if !value.is_finite() || value < 0.0 {
        bail!(lit.span(), "duration must be non-negative and finite");
    }
    let mut secs = format!("{}", to_secs(value));
    if !secs.contains(['.', 'e', 'E']) {
        secs.push_str(".0");
    }
    let secs = LitFloat::new(&secs, Span::call_site());
    Ok(quote!(::std::time::Duration::from_secs_f64(#secs)))
}
