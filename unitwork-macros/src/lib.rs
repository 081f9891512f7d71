// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::{FromDeriveInput, FromField, FromMeta, ast::Data, util::Flag};
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, Ident, Type, parse_macro_input};

/// Options of a `#[trace(...)]` field attribute.
#[derive(Debug, Default, FromMeta)]
struct TraceOptions {
    #[darling(default)]
    tag: Option<String>,
    skip: Flag,
    entity: Flag,
    sequence: Flag,
    mapping: Flag,
    scalar: Flag,
}

/// A named field with its `#[aggregate(...)]` flags and raw `#[trace]`
/// attributes.
#[derive(Debug, FromField)]
#[darling(attributes(aggregate), forward_attrs(trace))]
struct FieldArgs {
    ident: Option<Ident>,
    ty: Type,
    attrs: Vec<syn::Attribute>,
    id: Flag,
    state: Flag,
}

#[derive(Debug, FromDeriveInput)]
#[darling(supports(struct_named))]
struct AggregateArgs {
    ident: Ident,
    generics: syn::Generics,
    data: Data<(), FieldArgs>,
}

/// How a traced field is compared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Scalar,
    /// Sliceable sequence: `Vec`, arrays, boxed slices.
    Sequence,
    /// `VecDeque`, collected before reconciliation.
    Deque,
    Mapping,
}

/// Last path segment of a type, if it is a plain path.
fn type_name(ty: &Type) -> Option<String> {
    match ty {
        Type::Path(path) if path.qself.is_none() => {
            path.path.segments.last().map(|s| s.ident.to_string())
        }
        Type::Group(group) => type_name(&group.elem),
        Type::Paren(paren) => type_name(&paren.elem),
        _ => None,
    }
}

fn detect_kind(ty: &Type) -> Kind {
    if matches!(ty, Type::Array(_)) {
        return Kind::Sequence;
    }
    match type_name(ty).as_deref() {
        Some("Vec") => Kind::Sequence,
        Some("VecDeque") => Kind::Deque,
        Some("HashMap" | "BTreeMap") => Kind::Mapping,
        _ => Kind::Scalar,
    }
}

fn is_root_state(ty: &Type) -> bool {
    type_name(ty).as_deref() == Some("RootState")
}

/// A field that takes part in change tracking.
struct TracedField<'a> {
    ident: &'a Ident,
    tag: Option<String>,
    kind: Kind,
    entity: bool,
}

/// Field roles resolved from the attributes.
struct Fields<'a> {
    id: &'a Ident,
    state: Option<&'a Ident>,
    traced: Vec<TracedField<'a>>,
}

fn trace_options(field: &FieldArgs) -> darling::Result<TraceOptions> {
    let mut found = field.attrs.iter().filter(|attr| attr.path().is_ident("trace"));
    let Some(attr) = found.next() else {
        return Ok(TraceOptions::default());
    };
    if let Some(extra) = found.next() {
        return Err(darling::Error::custom("duplicate `#[trace(...)]` attribute").with_span(extra));
    }
    TraceOptions::from_meta(&attr.meta)
}

fn resolve_kind(field: &FieldArgs, options: &TraceOptions) -> darling::Result<Kind> {
    let overrides = [
        (options.sequence.is_present(), Kind::Sequence),
        (options.mapping.is_present(), Kind::Mapping),
        (options.scalar.is_present(), Kind::Scalar),
    ];
    let mut chosen = overrides.iter().filter(|(present, _)| *present);
    let kind = match (chosen.next(), chosen.next()) {
        (None, _) => detect_kind(&field.ty),
        (Some(&(_, Kind::Sequence)), None) if detect_kind(&field.ty) == Kind::Deque => Kind::Deque,
        (Some(&(_, kind)), None) => kind,
        (Some(_), Some(_)) => {
            return Err(darling::Error::custom(
                "`sequence`, `mapping` and `scalar` are mutually exclusive",
            )
            .with_span(&field.ty));
        }
    };
    if options.entity.is_present() && !matches!(kind, Kind::Sequence | Kind::Deque) {
        return Err(
            darling::Error::custom("`entity` only applies to sequence fields").with_span(&field.ty),
        );
    }
    Ok(kind)
}

/// Sort fields into identity, root state and traced fields.
fn resolve_fields<'a>(
    args: &'a AggregateArgs,
    want_state: bool,
) -> darling::Result<Fields<'a>> {
    let Data::Struct(fields) = &args.data else {
        return Err(darling::Error::unsupported_shape("expected a struct with named fields"));
    };

    let mut errors = darling::Error::accumulator();
    let mut explicit_id = None;
    let mut named_id = None;
    let mut explicit_state = None;
    let mut typed_state = None;

    for field in fields.iter() {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        if field.id.is_present() {
            if explicit_id.is_some() {
                errors.push(
                    darling::Error::custom("only one field can be `#[aggregate(id)]`")
                        .with_span(ident),
                );
            }
            explicit_id = Some(ident);
        } else if ident == "id" {
            named_id = Some(ident);
        }
        if field.state.is_present() {
            if explicit_state.is_some() {
                errors.push(
                    darling::Error::custom("only one field can be `#[aggregate(state)]`")
                        .with_span(ident),
                );
            }
            explicit_state = Some(ident);
        } else if is_root_state(&field.ty) && typed_state.is_none() {
            typed_state = Some(ident);
        }
    }

    let id = explicit_id.or(named_id);
    let state = explicit_state.or(typed_state);
    if id.is_none() {
        errors.push(
            darling::Error::custom("missing identity field: mark one with `#[aggregate(id)]`")
                .with_span(&args.ident),
        );
    }
    if want_state && state.is_none() {
        errors.push(
            darling::Error::custom(
                "missing root state: add a `RootState<Self>` field or mark one with \
                 `#[aggregate(state)]`",
            )
            .with_span(&args.ident),
        );
    }

    let mut traced = Vec::new();
    for field in fields.iter() {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        if Some(ident) == id || Some(ident) == state {
            continue;
        }
        let Some(options) = errors.handle(trace_options(field)) else {
            continue;
        };
        if options.skip.is_present() {
            continue;
        }
        let Some(kind) = errors.handle(resolve_kind(field, &options)) else {
            continue;
        };
        traced.push(TracedField {
            ident,
            tag: options.tag,
            kind,
            entity: options.entity.is_present(),
        });
    }

    errors.finish()?;
    match id {
        Some(id) => Ok(Fields { id, state, traced }),
        None => Err(darling::Error::custom("missing identity field")),
    }
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<F>(input: &DeriveInput, f: F) -> TokenStream2
where
    F: FnOnce(AggregateArgs) -> darling::Result<TokenStream2>,
{
    match AggregateArgs::from_derive_input(input).and_then(f) {
        Ok(tokens) => tokens,
        Err(err) => err.write_errors(),
    }
}

/// Derives `Aggregate` for a struct with named fields.
///
/// The identity is the field marked `#[aggregate(id)]`, or the field named
/// `id`. It must convert into `i64` with `From`.
///
/// Use `#[derive(AggregateRoot)]` instead for aggregate roots; it implements
/// `Aggregate` as well.
///
/// # Example
///
/// ```ignore
/// #[derive(Aggregate)]
/// pub struct Warehouse {
///     #[aggregate(id)]
///     code: i64,
///     city: String,
/// }
/// ```
#[proc_macro_derive(Aggregate, attributes(aggregate, trace))]
pub fn derive_aggregate(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_aggregate_impl(&input).into()
}

fn derive_aggregate_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error(input, |args| {
        let fields = resolve_fields(&args, false)?;
        Ok(generate_aggregate_impl(&args, &fields, false))
    })
}

fn generate_aggregate_impl(args: &AggregateArgs, fields: &Fields<'_>, root: bool) -> TokenStream2 {
    let struct_name = &args.ident;
    let id = fields.id;
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();

    let root_accessors = if root {
        quote! {
            fn as_root(&self) -> ::core::option::Option<&dyn ::unitwork::aggregate::RootTracking> {
                ::core::option::Option::Some(self)
            }

            fn as_root_mut(
                &mut self,
            ) -> ::core::option::Option<&mut dyn ::unitwork::aggregate::RootTracking> {
                ::core::option::Option::Some(self)
            }
        }
    } else {
        TokenStream2::new()
    };

    quote! {
        impl #impl_generics ::unitwork::aggregate::Aggregate for #struct_name #ty_generics #where_clause {
            fn aggregate_id(&self) -> i64 {
                ::core::convert::From::from(self.#id)
            }

            #root_accessors
        }
    }
}

/// Derives `Aggregate`, `AggregateRoot` and `Traced` for a struct with named
/// fields.
///
/// The struct must also implement `Clone`, and every traced field
/// `PartialEq`.
///
/// # Field attributes
///
/// - `#[aggregate(id)]` - the identity field (default: the field named `id`)
/// - `#[aggregate(state)]` - the `RootState<Self>` field (default: detected by
///   type)
/// - `#[trace(tag = "group,opts")]` - report changes of this field under
///   `group`; untagged fields mark the whole aggregate as changed
/// - `#[trace(skip)]` - exclude the field from change tracking
/// - `#[trace(entity)]` - reconcile a sequence of `Entity` elements by
///   identifier
/// - `#[trace(sequence)]`, `#[trace(mapping)]`, `#[trace(scalar)]` - override
///   the kind detected from the type (`Vec`, `VecDeque` and arrays are
///   sequences, `HashMap` and `BTreeMap` mappings, anything else scalar)
///
/// # Example
///
/// ```ignore
/// #[derive(Clone, AggregateRoot)]
/// pub struct Order {
///     #[aggregate(id)]
///     id: i64,
///     #[trace(tag = "address")]
///     street: String,
///     #[trace(tag = "lines", entity)]
///     lines: Vec<OrderLine>,
///     state: RootState<Order>,
/// }
/// ```
#[proc_macro_derive(AggregateRoot, attributes(aggregate, trace))]
pub fn derive_aggregate_root(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_aggregate_root_impl(&input).into()
}

fn derive_aggregate_root_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error(input, |args| {
        if !args.generics.params.is_empty() {
            return Err(
                darling::Error::custom("`AggregateRoot` cannot be derived for generic types")
                    .with_span(&args.generics),
            );
        }
        let fields = resolve_fields(&args, true)?;
        Ok(generate_aggregate_root_impl(&args, &fields))
    })
}

fn generate_field_descriptor(struct_name: &Ident, field: &TracedField<'_>) -> TokenStream2 {
    let ident = field.ident;
    let name = ident.to_string();
    let eq = quote! {
        |a: &#struct_name, b: &#struct_name| a.#ident == b.#ident
    };

    let kind = match field.kind {
        Kind::Scalar => quote! {
            ::unitwork::trace::FieldKind::Scalar { eq: #eq }
        },
        Kind::Sequence | Kind::Deque => {
            let (current, snapshot) = if field.kind == Kind::Deque {
                (
                    quote!(&a.#ident.iter().cloned().collect::<::std::vec::Vec<_>>()),
                    quote!(&b.#ident.iter().cloned().collect::<::std::vec::Vec<_>>()),
                )
            } else {
                (quote!(&a.#ident[..]), quote!(&b.#ident[..]))
            };
            let reconcile = if field.entity {
                quote!(::unitwork::trace::reconcile_entities)
            } else {
                quote!(::unitwork::trace::reconcile_anonymous)
            };
            quote! {
                ::unitwork::trace::FieldKind::Sequence {
                    eq: #eq,
                    reconcile: |a: &#struct_name, b: &#struct_name| #reconcile(#current, #snapshot),
                }
            }
        }
        Kind::Mapping => quote! {
            ::unitwork::trace::FieldKind::Mapping {
                eq: #eq,
                reconcile: |a: &#struct_name, b: &#struct_name| {
                    ::unitwork::trace::reconcile_mapping(&a.#ident, &b.#ident)
                },
            }
        },
    };

    match &field.tag {
        Some(tag) => quote! {
            ::unitwork::trace::FieldDescriptor::tagged(#name, #tag, #kind)
        },
        None => quote! {
            ::unitwork::trace::FieldDescriptor::untagged(#name, #kind)
        },
    }
}

fn generate_aggregate_root_impl(args: &AggregateArgs, fields: &Fields<'_>) -> TokenStream2 {
    let struct_name = &args.ident;
    let aggregate_impl = generate_aggregate_impl(args, fields, true);
    let descriptors = fields
        .traced
        .iter()
        .map(|field| generate_field_descriptor(struct_name, field));

    let root_impl = fields.state.map(|state| {
        quote! {
            impl ::unitwork::aggregate::AggregateRoot for #struct_name {
                fn root_state(&self) -> &::unitwork::aggregate::RootState<Self> {
                    &self.#state
                }

                fn root_state_mut(&mut self) -> &mut ::unitwork::aggregate::RootState<Self> {
                    &mut self.#state
                }
            }
        }
    });

    quote! {
        #aggregate_impl

        #root_impl

        impl ::unitwork::trace::Traced for #struct_name {
            fn descriptor() -> &'static ::unitwork::trace::Descriptor<Self> {
                static DESCRIPTOR: ::std::sync::OnceLock<::unitwork::trace::Descriptor<#struct_name>> =
                    ::std::sync::OnceLock::new();
                DESCRIPTOR.get_or_init(|| {
                    ::unitwork::trace::Descriptor::new(::std::vec![#(#descriptors),*])
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use syn::parse_quote;

    use super::*;

    /// Normalise token output by removing whitespace.
    fn compact(tokens: &TokenStream2) -> String {
        tokens
            .to_string()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect()
    }

    #[test]
    fn kinds_are_detected_from_types() {
        assert_eq!(detect_kind(&parse_quote!(Vec<Line>)), Kind::Sequence);
        assert_eq!(detect_kind(&parse_quote!([u8; 4])), Kind::Sequence);
        assert_eq!(
            detect_kind(&parse_quote!(std::collections::VecDeque<u8>)),
            Kind::Deque
        );
        assert_eq!(detect_kind(&parse_quote!(BTreeMap<String, u8>)), Kind::Mapping);
        assert_eq!(detect_kind(&parse_quote!(String)), Kind::Scalar);
    }

    #[test]
    fn aggregate_uses_field_named_id_by_default() {
        let input: DeriveInput = parse_quote! {
            pub struct Warehouse {
                id: i64,
                city: String,
            }
        };

        let compact = compact(&derive_aggregate_impl(&input));

        assert!(compact.contains("impl::unitwork::aggregate::AggregateforWarehouse"));
        assert!(compact.contains("::core::convert::From::from(self.id)"));
        assert!(!compact.contains("as_root"));
    }

    #[test]
    fn explicit_id_wins_over_field_name() {
        let input: DeriveInput = parse_quote! {
            pub struct Warehouse {
                id: String,
                #[aggregate(id)]
                code: i64,
            }
        };

        let compact = compact(&derive_aggregate_impl(&input));

        assert!(compact.contains("::core::convert::From::from(self.code)"));
    }

    #[test]
    fn missing_id_is_an_error() {
        let input: DeriveInput = parse_quote! {
            pub struct Warehouse {
                city: String,
            }
        };

        let compact = compact(&derive_aggregate_impl(&input));

        assert!(compact.contains("missingidentityfield"));
    }

    #[test]
    fn root_generates_descriptor_for_traced_fields() {
        let input: DeriveInput = parse_quote! {
            pub struct Order {
                id: i64,
                #[trace(tag = "address")]
                street: String,
                note: String,
                #[trace(tag = "lines", entity)]
                lines: Vec<OrderLine>,
                #[trace(tag = "labels")]
                labels: BTreeMap<String, String>,
                #[trace(skip)]
                cache: u64,
                state: RootState<Order>,
            }
        };

        let compact = compact(&derive_aggregate_root_impl(&input));

        assert!(compact.contains("impl::unitwork::aggregate::AggregateRootforOrder"));
        assert!(compact.contains("&self.state"));
        assert!(compact.contains("FieldDescriptor::tagged(\"street\",\"address\""));
        assert!(compact.contains("FieldDescriptor::untagged(\"note\""));
        assert!(compact.contains("reconcile_entities(&a.lines[..],&b.lines[..])"));
        assert!(compact.contains("reconcile_mapping(&a.labels,&b.labels)"));
        assert!(!compact.contains("\"cache\""));
        assert!(!compact.contains("\"id\""));
        assert!(!compact.contains("\"state\""));
    }

    #[test]
    fn root_without_state_is_an_error() {
        let input: DeriveInput = parse_quote! {
            pub struct Order {
                id: i64,
            }
        };

        let compact = compact(&derive_aggregate_root_impl(&input));

        assert!(compact.contains("missingrootstate"));
    }

    #[test]
    fn entity_on_scalar_is_an_error() {
        let input: DeriveInput = parse_quote! {
            pub struct Order {
                id: i64,
                #[trace(entity)]
                street: String,
                state: RootState<Order>,
            }
        };

        let compact = compact(&derive_aggregate_root_impl(&input));

        assert!(compact.contains("`entity`onlyappliestosequencefields"));
    }

    #[test]
    fn conflicting_kind_overrides_are_an_error() {
        let input: DeriveInput = parse_quote! {
            pub struct Order {
                id: i64,
                #[trace(sequence, scalar)]
                street: String,
                state: RootState<Order>,
            }
        };

        let compact = compact(&derive_aggregate_root_impl(&input));

        assert!(compact.contains("mutuallyexclusive"));
    }

    #[test]
    fn generic_roots_are_rejected() {
        let input: DeriveInput = parse_quote! {
            pub struct Order<T> {
                id: i64,
                extra: T,
                state: RootState<Order<T>>,
            }
        };

        let compact = compact(&derive_aggregate_root_impl(&input));

        assert!(compact.contains("cannotbederivedforgenerictypes"));
    }
}
