//! Attribute macros that turn plain config structs into pipeline stages.
//!
//! `#[Task(...)]` attaches planning and execution glue to a stage config
//! struct; the struct provides `fn run(cfg, doc, ctx)`. `#[Module(...)]`
//! groups tasks and registers them with the executor.

use proc_macro::TokenStream;

use quote::quote;
use syn::parse_quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    match task_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    match module_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn string_list(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems.iter().map(lit_str).collect()
}

fn path_list(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    elems
        .iter()
        .map(|e| match e {
            Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
            _ => Err(syn::Error::new(e.span(), "expected path (identifier)")),
        })
        .collect()
}

fn type_of(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => syn::parse_str::<syn::Type>(&s.value()).map_err(|e| syn::Error::new(expr.span(), e)),
        _ => Err(syn::Error::new(
            expr.span(),
            "expected type (path) or string",
        )),
    }
}

fn strip_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| match &a.meta {
            Meta::Path(p) => p
                .get_ident()
                .map(|ident| ident != "Task" && ident != "Module")
                .unwrap_or(true),
            _ => true,
        })
        .cloned()
        .collect()
}

/// Precondition tokens the executor knows how to check.
const KNOWN_REQUIRES: &[&str] = &["mounts:active", "root:privileged"];

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut module: Option<String> = None;
    let mut phase: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut provides: Vec<String> = Vec::new();
    let mut after: Vec<String> = Vec::new();
    let mut requires: Vec<String> = Vec::new();
    let mut default_label: Option<String> = None;
    let mut core = false;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "module" => module = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "config" => config_ty = Some(type_of(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "provides" => provides = string_list(v)?,
            "after" => after = string_list(v)?,
            "requires" => {
                requires = string_list(v)?;
                if let Some(bad) = requires
                    .iter()
                    .find(|r| !KNOWN_REQUIRES.contains(&r.as_str()))
                {
                    return Err(syn::Error::new(
                        v.span(),
                        format!(
                            "unknown precondition '{bad}' (known: {})",
                            KNOWN_REQUIRES.join(", ")
                        ),
                    ));
                }
            }
            "default_label" => default_label = Some(lit_str(v)?),
            "core" => core = lit_bool(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Task attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing id"))?;
    let module =
        module.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing module"))?;
    let phase = phase.ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing phase"))?;
    let default_label = default_label
        .ok_or_else(|| syn::Error::new(struct_ident.span(), "Task: missing default_label"))?;

    let config_ty = config_ty.unwrap_or_else(|| parse_quote!(#struct_ident));

    // Default config location is <module>.steps.<last id segment>.
    let config_path = match config_path {
        Some(p) => p,
        None => {
            let Some(step) = id.strip_prefix(&format!("{module}.")) else {
                return Err(syn::Error::new(
                    struct_ident.span(),
                    "Task: config_path omitted but id does not start with '<module>.'",
                ));
            };
            let step = step.rsplit('.').next().unwrap_or(step);
            format!("{module}.steps.{step}")
        }
    };

    let disabled_check = if core {
        quote! {
            if !cfg.enabled {
                return Err(crate::Error::config(format!(
                    "[{}].enabled=false is not allowed (required stage)",
                    #config_path
                )));
            }
        }
    } else {
        quote! {
            if !cfg.enabled {
                return Ok(());
            }
        }
    };

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;
            pub const REQUIRES: &'static [&'static str] = &[#(#requires),*];
            pub const CORE: bool = #core;

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #disabled_check

                let label = cfg
                    .label
                    .clone()
                    .unwrap_or_else(|| #default_label.to_string());

                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label,
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                    requires: Self::REQUIRES.iter().map(|r| r.to_string()).collect(),
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();

                #disabled_check

                // Stages implement
                // `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`
                // and consult `ctx.dry_run` themselves for side effects.
                Self::run(&cfg, doc, ctx)
            }
        }
    };

    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut config_ty: Option<syn::Type> = None;
    let mut config_path: Option<String> = None;
    let mut tasks: Option<Vec<syn::Path>> = None;
    let mut optional = false;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "config" => config_ty = Some(type_of(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "tasks" => tasks = Some(path_list(v)?),
            "optional" => optional = lit_bool(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Module attribute key '{other}'"),
                ));
            }
        }
    }

    let id = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing id"))?;
    let config_ty =
        config_ty.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing config"))?;
    let config_path = config_path
        .ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing config_path"))?;
    let tasks = tasks.ok_or_else(|| syn::Error::new(struct_ident.span(), "Module: missing tasks"))?;

    // Pipeline modules always take part; optional ones only when their table is present.
    let detect_body = if optional {
        quote! { doc.has_table_path(#config_path) }
    } else {
        quote! {
            let _ = doc;
            true
        }
    };

    let plan_tasks = tasks.iter().map(|p| quote! { #p::plan(doc, plan)?; });
    let register_tasks = tasks.iter().map(|p| quote! { reg.add(#p::ID, #p::exec)?; });

    let expanded = quote! {
        #st

        impl crate::modules::Module for #struct_ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                #detect_body
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc
                    .deserialize_path::<#config_ty>(#config_path)?
                    .unwrap_or_default();
                if !cfg.enabled {
                    return Ok(());
                }

                #(#plan_tasks)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #struct_ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(#register_tasks)*
                Ok(())
            }
        }
    };

    Ok(expanded.into())
}
