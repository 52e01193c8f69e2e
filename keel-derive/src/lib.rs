//! A derive macro for the `DomainEvent` trait in the `keel` crate.
use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Fields, LitStr, parse_macro_input};

/// Derives the `DomainEvent` trait for an enum.
///
/// `event_type` returns the variant's name. The name can be overridden per
/// variant with `#[event(name = "...")]`, and every generated name can be
/// prefixed with `#[event(prefix = "...")]` on the enum:
///
/// ```ignore
/// #[derive(Serialize, Debug, DomainEvent)]
/// #[event(prefix = "Page")]
/// enum PageEvent {
///     Created { title: String },          // "PageCreated"
///     #[event(name = "PageRenamed")]
///     TitleChanged { title: String },     // "PageRenamed"
/// }
/// ```
#[proc_macro_derive(DomainEvent, attributes(event))]
pub fn domain_event_derive(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;

    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(
            name,
            "DomainEvent can only be derived for enums",
        ));
    };

    let prefix = event_attr(&input.attrs, "prefix")?.unwrap_or_default();

    let event_type_arms = data
        .variants
        .iter()
        .map(|variant| {
            let variant_name = &variant.ident;
            let fields = match &variant.fields {
                Fields::Named(_) => quote! { { .. } },
                Fields::Unnamed(_) => quote! { (..) },
                Fields::Unit => quote! {},
            };
            let event_type = match event_attr(&variant.attrs, "name")? {
                Some(explicit) => explicit,
                None => format!("{prefix}{variant_name}"),
            };
            Ok(quote! {
                Self::#variant_name #fields => #event_type
            })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    let body = if event_type_arms.is_empty() {
        quote! { match *self {} }
    } else {
        quote! { match self { #(#event_type_arms),* } }
    };

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::keel::DomainEvent for #name #ty_generics #where_clause {
            fn event_type(&self) -> &'static str {
                #body
            }
        }
    })
}

/// Reads `key = "..."` from the `#[event(...)]` attributes. `key` is the only
/// key accepted at this level.
fn event_attr(attrs: &[Attribute], key: &str) -> syn::Result<Option<String>> {
    let mut value = None;
    for attr in attrs.iter().filter(|attr| attr.path().is_ident("event")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident(key) {
                let lit: LitStr = meta.value()?.parse()?;
                value = Some(lit.value());
                Ok(())
            } else if meta.path.is_ident("name") || meta.path.is_ident("prefix") {
                Err(meta.error(format!("only `{key}` is allowed here")))
            } else {
                Err(meta.error(format!("expected `{key}`")))
            }
        })?;
    }
    Ok(value)
}
